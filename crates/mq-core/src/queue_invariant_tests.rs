//! Property tests for the queue invariants.
//!
//! Random sequences of the operations the drivers actually perform
//! (enqueue, dequeue, promote-head, pass-head, fail-head-and-advance) are
//! applied to a fresh store, and the structural invariants are checked
//! after every step:
//!
//! 1. at most one non-Queued active entry per (repo, target branch);
//! 2. the head is the active entry with the smallest enqueued_at;
//! 3. only the head is in Testing or Success;
//! 4. FIFO: relative order within a target branch never changes;
//! 5. a PR is active in at most one queue at a time.

use std::collections::HashMap;

use proptest::prelude::*;

use crate::database::Store;
use crate::queue::EntryState;
use crate::queue_service::QueueService;
use crate::repo::Repo;

const BRANCHES: [&str; 2] = ["main", "develop"];

#[derive(Debug, Clone)]
enum Op {
    Enqueue { pr: i64, branch: usize },
    Dequeue { pr: i64 },
    PromoteHead { branch: usize },
    PassHead { branch: usize },
    FailHeadAndAdvance { branch: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..8, 0usize..2).prop_map(|(pr, branch)| Op::Enqueue { pr, branch }),
        (1i64..8).prop_map(|pr| Op::Dequeue { pr }),
        (0usize..2).prop_map(|branch| Op::PromoteHead { branch }),
        (0usize..2).prop_map(|branch| Op::PassHead { branch }),
        (0usize..2).prop_map(|branch| Op::FailHeadAndAdvance { branch }),
    ]
}

/// In-test model: enqueue order per branch, for the FIFO assertion.
#[derive(Default)]
struct Model {
    order: HashMap<String, Vec<i64>>,
}

impl Model {
    fn contains(&self, pr: i64) -> bool {
        self.order.values().any(|prs| prs.contains(&pr))
    }

    fn enqueue(&mut self, pr: i64, branch: &str) {
        if !self.contains(pr) {
            self.order.entry(branch.to_string()).or_default().push(pr);
        }
    }

    fn remove(&mut self, pr: i64) {
        for prs in self.order.values_mut() {
            prs.retain(|&p| p != pr);
        }
    }
}

async fn apply(svc: &QueueService, repo: &Repo, model: &mut Model, op: &Op) {
    match op {
        Op::Enqueue { pr, branch } => {
            let branch = BRANCHES[*branch];
            svc.enqueue(repo, *pr, &format!("sha-{pr}"), branch)
                .await
                .unwrap();
            model.enqueue(*pr, branch);
        }
        Op::Dequeue { pr } => {
            svc.dequeue(repo, *pr).await.unwrap();
            model.remove(*pr);
        }
        Op::PromoteHead { branch } => {
            let branch = BRANCHES[*branch];
            if let Some(head) = svc.head(repo, branch).await.unwrap() {
                if head.state == EntryState::Queued {
                    svc.update_state(repo, head.pr_number, EntryState::Testing)
                        .await
                        .unwrap();
                }
            }
        }
        Op::PassHead { branch } => {
            let branch = BRANCHES[*branch];
            if let Some(head) = svc.head(repo, branch).await.unwrap() {
                if head.state == EntryState::Testing {
                    svc.update_state(repo, head.pr_number, EntryState::Success)
                        .await
                        .unwrap();
                }
            }
        }
        Op::FailHeadAndAdvance { branch } => {
            let branch = BRANCHES[*branch];
            if let Some(head) = svc.head(repo, branch).await.unwrap() {
                if head.state == EntryState::Testing {
                    svc.update_state(repo, head.pr_number, EntryState::Failed)
                        .await
                        .unwrap();
                    svc.advance(repo, branch).await.unwrap();
                    model.remove(head.pr_number);
                }
            }
        }
    }
}

async fn assert_invariants(svc: &QueueService, repo: &Repo, model: &Model) {
    let active = svc.list_active(repo).await.unwrap();

    // Invariant 5: (repo, pr) unique among active entries.
    let mut seen = Vec::new();
    for entry in &active {
        assert!(
            !seen.contains(&entry.pr_number),
            "PR {} active twice",
            entry.pr_number
        );
        seen.push(entry.pr_number);
    }

    for branch in BRANCHES {
        let in_branch: Vec<_> = active
            .iter()
            .filter(|e| e.target_branch == branch)
            .collect();

        // Invariant 1: at most one non-Queued active entry.
        let non_queued: Vec<_> = in_branch
            .iter()
            .filter(|e| e.state != EntryState::Queued)
            .collect();
        assert!(
            non_queued.len() <= 1,
            "{branch}: {} non-queued active entries",
            non_queued.len()
        );

        // Invariants 2 + 3: the non-Queued entry, if any, is the head.
        let head = svc.head(repo, branch).await.unwrap();
        if let Some(first) = in_branch.first() {
            let head = head.expect("active entries but no head");
            assert_eq!(head.id, first.id, "{branch}: head is not the oldest");
            for entry in in_branch.iter().skip(1) {
                assert_eq!(
                    entry.state,
                    EntryState::Queued,
                    "{branch}: non-head PR {} is {:?}",
                    entry.pr_number,
                    entry.state
                );
            }
        } else {
            assert!(head.is_none());
        }

        // Invariant 6: FIFO order matches the model's enqueue order.
        let actual: Vec<i64> = in_branch.iter().map(|e| e.pr_number).collect();
        let expected: Vec<i64> = model
            .order
            .get(branch)
            .map(|prs| prs.clone())
            .unwrap_or_default();
        assert_eq!(actual, expected, "{branch}: FIFO order diverged");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn queue_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let svc = QueueService::new(Store::in_memory().await.unwrap());
            let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();
            let mut model = Model::default();

            for op in &ops {
                apply(&svc, &repo, &mut model, op).await;
                assert_invariants(&svc, &repo, &model).await;
            }
        });
    }
}
