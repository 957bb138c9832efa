//! End-to-end pipeline tests over literal region graphs

use comber::ast::{AstNode, LoopKind};
use comber::graph::NodeId;
use comber::input::{BlockRecord, EdgeRecord, RegionInput};
use comber::passes::{restructure_region, RegionStatus};
use comber::RestructureConfig;

fn edge(target: u64) -> EdgeRecord {
    EdgeRecord { target, labels: vec![], inlined: false }
}

fn labeled_edge(target: u64, label: i64) -> EdgeRecord {
    EdgeRecord { target, labels: vec![label], inlined: false }
}

fn block(id: u64, weight: u32, edges: Vec<EdgeRecord>) -> BlockRecord {
    BlockRecord { id, payload: None, name: None, weight, edges, scope_closer: None }
}

fn region(entry: u64, blocks: Vec<BlockRecord>) -> RegionInput {
    RegionInput { function: "f".into(), region: "root".into(), entry, blocks }
}

fn restructured(input: &RegionInput) -> AstNode {
    let report = restructure_region(input, &RestructureConfig::default());
    match report.status {
        RegionStatus::Restructured(ast) => ast,
        RegionStatus::Unrestructured { error, .. } => {
            panic!("region unexpectedly rejected: {error}")
        }
    }
}

fn sorted_leaves(ast: &AstNode) -> Vec<u64> {
    let mut ids: Vec<u64> = ast.leaf_ids().iter().map(|id| id.0).collect();
    ids.sort();
    ids
}

fn find_loops(ast: &AstNode, out: &mut Vec<(LoopKind, AstNode)>) {
    match ast {
        AstNode::Sequence(items) => {
            for item in items {
                find_loops(item, out);
            }
        }
        AstNode::If { then_body, else_body, .. } => {
            for body in [then_body, else_body].into_iter().flatten() {
                find_loops(body, out);
            }
        }
        AstNode::Loop { kind, body, .. } => {
            out.push((*kind, (**body).clone()));
            find_loops(body, out);
        }
        AstNode::Switch { cases, default, .. } => {
            for case in cases {
                find_loops(&case.body, out);
            }
            if let Some(body) = default {
                find_loops(body, out);
            }
        }
        AstNode::Scope { body, .. } => find_loops(body, out),
        _ => {}
    }
}

/// Diamond that needs no restructuring at all:
/// 1 -> {2,3}, 2 -> 4, 3 -> 4.
#[test]
fn diamond_needs_no_duplication() {
    let input = region(
        1,
        vec![
            block(1, 1, vec![edge(2), edge(3)]),
            block(2, 1, vec![edge(4)]),
            block(3, 1, vec![edge(4)]),
            block(4, 1, vec![]),
        ],
    );
    let ast = restructured(&input);

    // No node duplicated: each input id appears exactly once.
    assert_eq!(sorted_leaves(&ast), vec![1, 2, 3, 4]);

    let AstNode::Sequence(items) = &ast else { panic!("expected a sequence") };
    assert_eq!(items[0], AstNode::Leaf(NodeId(1)));
    let AstNode::If { condition, then_body, else_body } = &items[1] else {
        panic!("expected an if, got {:?}", items[1])
    };
    assert_eq!(*condition, NodeId(1));
    assert_eq!(**then_body.as_ref().unwrap(), AstNode::Leaf(NodeId(2)));
    assert_eq!(**else_body.as_ref().unwrap(), AstNode::Leaf(NodeId(3)));
    assert_eq!(items[2], AstNode::Leaf(NodeId(4)));
}

/// Weighted diamond with a heavy arm: both arms are exclusively owned by
/// the conditional, so neither untangle nor inflate duplicates anything.
#[test]
fn weighted_diamond_still_combs_cleanly() {
    let input = region(
        1,
        vec![
            block(1, 1, vec![edge(2), edge(3)]),
            block(2, 1, vec![edge(4)]),
            block(3, 10, vec![edge(4)]),
            block(4, 20, vec![]),
        ],
    );
    let ast = restructured(&input);
    assert_eq!(sorted_leaves(&ast), vec![1, 2, 3, 4]);
}

/// A heavy node shared by both arms of a conditional, with a cheap tail:
/// untangle clones the bypass arm to the exit instead of combing.
#[test]
fn untangle_splits_the_cheap_arm() {
    let input = region(
        0,
        vec![
            block(0, 1, vec![edge(1), edge(2)]),
            block(1, 1, vec![edge(3), edge(4)]),
            block(2, 1, vec![edge(3)]),
            block(3, 100, vec![edge(4)]),
            block(4, 1, vec![edge(5)]),
            block(5, 1, vec![]),
        ],
    );
    let ast = restructured(&input);

    // Two clones appeared (the duplicated tail 4 -> 5); every input id is
    // still present exactly once.
    let leaves = sorted_leaves(&ast);
    assert_eq!(leaves.len(), 8);
    for id in 0..=5 {
        assert_eq!(leaves.iter().filter(|&&l| l == id).count(), 1, "id {id}");
    }
}

/// Irreducible CFG: 1 -> {2,3}, 2 -> 3, 3 -> 2, 2 -> 4. The late entry 3
/// is duplicated, the remaining single-entry cycle becomes a loop.
#[test]
fn irreducible_cycle_becomes_loop_plus_clone() {
    let input = region(
        1,
        vec![
            block(1, 1, vec![edge(2), edge(3)]),
            block(2, 1, vec![edge(3), edge(4)]),
            block(3, 1, vec![edge(2)]),
            block(4, 1, vec![]),
        ],
    );
    let ast = restructured(&input);

    let mut loops = Vec::new();
    find_loops(&ast, &mut loops);
    assert_eq!(loops.len(), 1);
    let (kind, body) = &loops[0];
    // The loop breaks out at its head.
    assert_eq!(*kind, LoopKind::While);
    let mut body_leaves: Vec<u64> = body.leaf_ids().iter().map(|id| id.0).collect();
    body_leaves.sort();
    assert_eq!(body_leaves, vec![2, 3]);

    // One clone of node 3 lives outside the loop: ids 1..4 once each plus
    // one fresh clone id.
    let leaves = sorted_leaves(&ast);
    assert_eq!(leaves.len(), 5);
    for id in 1..=4 {
        assert_eq!(leaves.iter().filter(|&&l| l == id).count(), 1, "id {id}");
    }
    assert!(*leaves.last().unwrap() > 4);
}

/// Switch weaving: cases 2 and 3 converge on 5 before the common
/// post-dominator 7, so they are pulled into a sub-switch.
#[test]
fn switch_cases_are_woven_into_a_sub_switch() {
    let input = region(
        1,
        vec![
            block(1, 1, vec![labeled_edge(2, 2), labeled_edge(3, 3), labeled_edge(4, 4)]),
            block(2, 1, vec![edge(5)]),
            block(3, 1, vec![edge(5)]),
            block(4, 1, vec![edge(6)]),
            block(5, 1, vec![edge(7)]),
            block(6, 1, vec![edge(7)]),
            block(7, 1, vec![]),
        ],
    );
    let ast = restructured(&input);

    let AstNode::Sequence(items) = &ast else { panic!("expected a sequence") };
    let AstNode::Switch { scrutinee, cases, .. } = &items[1] else {
        panic!("expected a switch, got {:?}", items[1])
    };
    assert_eq!(*scrutinee, NodeId(1));
    assert_eq!(cases.len(), 2);

    // One case is the untouched 4 -> 6 path, the other carries the merged
    // labels and contains the inner switch over 2 and 3.
    let woven = cases
        .iter()
        .find(|case| case.labels == vec![2, 3])
        .expect("merged case labels");
    let mut inner = Vec::new();
    collect_switches(&woven.body, &mut inner);
    assert_eq!(inner.len(), 1);
    let (inner_cases, _) = &inner[0];
    assert_eq!(inner_cases.len(), 2);

    // 5 sits after the inner switch, 7 after the outer one; no duplication.
    assert_eq!(sorted_leaves(&ast).len(), 8); // 7 input ids + weaved scrutinee clone
}

fn collect_switches(ast: &AstNode, out: &mut Vec<(Vec<Vec<i64>>, bool)>) {
    match ast {
        AstNode::Sequence(items) => {
            for item in items {
                collect_switches(item, out);
            }
        }
        AstNode::Switch { cases, default, .. } => {
            out.push((
                cases.iter().map(|c| c.labels.clone()).collect(),
                default.is_some(),
            ));
            for case in cases {
                collect_switches(&case.body, out);
            }
            if let Some(body) = default {
                collect_switches(body, out);
            }
        }
        AstNode::If { then_body, else_body, .. } => {
            for body in [then_body, else_body].into_iter().flatten() {
                collect_switches(body, out);
            }
        }
        AstNode::Loop { body, .. } | AstNode::Scope { body, .. } => {
            collect_switches(body, out)
        }
        _ => {}
    }
}

/// Exit-less loop: 1 -> 2 -> 3 -> 2. Single-exit enforcement roots the
/// post-dominators, collapse turns the cycle into an infinite loop.
#[test]
fn exitless_loop_becomes_infinite() {
    let input = region(
        1,
        vec![
            block(1, 1, vec![edge(2)]),
            block(2, 1, vec![edge(3)]),
            block(3, 1, vec![edge(2)]),
        ],
    );
    let ast = restructured(&input);

    let mut loops = Vec::new();
    find_loops(&ast, &mut loops);
    assert_eq!(loops.len(), 1);
    let (kind, body) = &loops[0];
    assert_eq!(*kind, LoopKind::Infinite);
    let mut body_leaves: Vec<u64> = body.leaf_ids().iter().map(|id| id.0).collect();
    body_leaves.sort();
    assert_eq!(body_leaves, vec![2, 3]);

    // The loop never exits: nothing is emitted after it.
    let AstNode::Sequence(items) = &ast else { panic!("expected a sequence") };
    assert_eq!(items[0], AstNode::Leaf(NodeId(1)));
    assert!(matches!(items[1], AstNode::Loop { .. }));
    assert_eq!(items.len(), 2);
}

/// Loop with a break: classified as do-while, break target recorded.
#[test]
fn breaking_loop_records_its_exit_target() {
    let input = region(
        0,
        vec![
            block(0, 1, vec![edge(1)]),
            block(1, 1, vec![edge(2)]),
            block(2, 1, vec![edge(1), edge(3)]),
            block(3, 1, vec![]),
        ],
    );
    let ast = restructured(&input);

    let mut loops = Vec::new();
    find_loops(&ast, &mut loops);
    assert_eq!(loops.len(), 1);

    let AstNode::Sequence(items) = &ast else { panic!("expected a sequence") };
    let AstNode::Loop { exit_targets, .. } = &items[1] else { panic!("expected a loop") };
    assert_eq!(exit_targets, &vec![NodeId(3)]);
    assert_eq!(*items.last().unwrap(), AstNode::Leaf(NodeId(3)));
}

/// The duplication budget rejects a region instead of blowing it up.
#[test]
fn duplication_budget_rejects_region() {
    let input = region(
        0,
        vec![
            block(0, 1, vec![edge(1), edge(4)]),
            block(1, 1, vec![edge(2), edge(3)]),
            block(2, 1, vec![edge(4)]),
            block(3, 1, vec![edge(5)]),
            block(4, 1, vec![edge(5)]),
            block(5, 1, vec![]),
        ],
    );
    let config = RestructureConfig {
        inflate_max_duplications: Some(0),
        ..Default::default()
    };
    let report = restructure_region(&input, &config);
    let RegionStatus::Unrestructured { error, .. } = &report.status else {
        panic!("expected rejection")
    };
    assert!(error.contains("duplication budget"), "got: {error}");
}
