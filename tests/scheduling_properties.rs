//! Property tests for admission control and dependency ordering.

use futures::future::join_all;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use agent_conductor::agents::ResourceLimits;
use agent_conductor::{
    AgentId, AgentSpec, AgentState, ExecutionStrategy, OrchestrationError, ResourceLimiter,
    SessionPlan, SessionState, ShutdownMode,
};

mod fixtures;
use fixtures::{assert_counters, fast_settings, Harness};

#[derive(Debug, Clone)]
struct PlannedAgent {
    /// Indices of earlier agents this one depends on
    deps: Vec<usize>,
    succeeds: bool,
}

fn dag(max_agents: usize) -> impl Strategy<Value = Vec<PlannedAgent>> {
    (1..=max_agents).prop_flat_map(|n| {
        let agents: Vec<_> = (0..n)
            .map(|index| {
                (
                    proptest::collection::vec(any::<bool>(), index),
                    prop::bool::weighted(0.8),
                )
                    .prop_map(|(picks, succeeds)| PlannedAgent {
                        deps: picks
                            .iter()
                            .enumerate()
                            .filter_map(|(dep, picked)| picked.then_some(dep))
                            .collect(),
                        succeeds,
                    })
            })
            .collect();
        agents
    })
}

proptest! {
    #[test]
    fn concurrent_admissions_never_exceed_the_global_cap(
        requests in 1usize..40,
        cap in 1usize..10,
    ) {
        let limiter = Arc::new(ResourceLimiter::new(ResourceLimits {
            max_active_agents: cap,
            default_role_cap: usize::MAX,
            role_caps: Default::default(),
            memory_budget_mb: u64::MAX,
        }));

        let admitted = thread::scope(|scope| {
            let handles: Vec<_> = (0..requests)
                .map(|n| {
                    let limiter = limiter.clone();
                    scope.spawn(move || limiter.try_admit(&format!("role{}", n % 3), 64).ok())
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        prop_assert_eq!(admitted.len(), requests.min(cap));
        prop_assert_eq!(limiter.usage().active_agents, requests.min(cap));
        prop_assert_eq!(limiter.usage().reserved_memory_mb, 64 * requests.min(cap) as u64);
        for reservation in admitted {
            limiter.release(reservation);
        }
        prop_assert_eq!(limiter.usage().active_agents, 0);
    }

    #[test]
    fn concurrent_spawns_through_the_orchestrator_respect_every_cap(
        requests in 1usize..12,
        cap in 2usize..8,
        role_cap in 1usize..4,
    ) {
        tokio_test::block_on(async move {
            let mut settings = fast_settings();
            settings.limits = ResourceLimits {
                max_active_agents: cap,
                default_role_cap: usize::MAX,
                role_caps: HashMap::from([("worker".to_string(), role_cap)]),
                memory_budget_mb: u64::MAX,
            };
            let h = Harness::with_settings(settings);

            // One long-lived agent keeps the session running while workers are added
            let mut plan = SessionPlan::new("burst", ExecutionStrategy::Parallel);
            plan.agent(AgentSpec::new("anchor", "hold the session open"));
            let session = h.orchestrator.create_session(plan).await.unwrap();
            h.orchestrator.start_session(&session).await.unwrap();

            let spawns = (0..requests).map(|n| {
                let orchestrator = h.orchestrator.clone();
                let session = session.clone();
                async move {
                    orchestrator
                        .spawn_agent(&session, AgentSpec::new("worker", format!("chunk {n}")))
                        .await
                }
            });
            let results = join_all(spawns).await;

            let admitted = results.iter().filter(|result| result.is_ok()).count();
            let expected = requests.min(cap - 1).min(role_cap);
            assert_eq!(admitted, expected);
            for result in &results {
                if let Err(e) = result {
                    assert!(matches!(e, OrchestrationError::AdmissionDenied(_)), "{e}");
                }
            }

            let usage = h.orchestrator.resource_usage().await.unwrap();
            assert!(usage.active_agents <= cap);
            assert_eq!(usage.active_agents, expected + 1);
            assert_eq!(usage.active_by_role.get("worker").copied().unwrap_or(0), expected);

            let snapshot = h.status(&session).await;
            assert_counters(&snapshot);
            assert_eq!(snapshot.agents.len(), expected + 1);
            assert!(snapshot.agents.iter().all(|agent| agent.state == AgentState::Running));

            h.stop().await;
        });
    }

    #[test]
    fn agents_never_run_before_their_dependencies_complete(
        agents in dag(7),
        adaptive in any::<bool>(),
    ) {
        let strategy = if adaptive { ExecutionStrategy::Adaptive } else { ExecutionStrategy::Parallel };
        tokio_test::block_on(async move {
            let h = Harness::new();
            let mut plan = SessionPlan::new("property", strategy);
            let mut ids: Vec<AgentId> = Vec::new();
            for agent in &agents {
                let deps: Vec<AgentId> = agent.deps.iter().map(|dep| ids[*dep].clone()).collect();
                ids.push(plan.agent(AgentSpec::new("worker", "step").depends_on(deps)));
            }

            let session = h.orchestrator.create_session(plan).await.unwrap();
            h.orchestrator.start_session(&session).await.unwrap();

            loop {
                let snapshot = h.status(&session).await;
                assert_counters(&snapshot);
                for agent in &snapshot.agents {
                    if agent.state == AgentState::Running {
                        for dep in &agent.dependencies {
                            let dep_state = fixtures::agent_in(&snapshot, dep.as_str()).state;
                            assert_eq!(dep_state, AgentState::Completed, "{} ran before {dep}", agent.id);
                        }
                    }
                }
                if snapshot.session.state.is_terminal() {
                    let all_succeed = agents.iter().all(|agent| agent.succeeds);
                    let expected = if all_succeed { SessionState::Completed } else { SessionState::Failed };
                    assert_eq!(snapshot.session.state, expected);
                    break;
                }

                let running: Vec<AgentId> = snapshot
                    .agents
                    .iter()
                    .filter(|agent| agent.state == AgentState::Running)
                    .map(|agent| agent.id.clone())
                    .collect();
                assert!(!running.is_empty(), "session stalled: {:?}", snapshot.session);
                for id in running {
                    let index = ids.iter().position(|known| known == &id).unwrap();
                    let code = if agents[index].succeeds { 0 } else { 1 };
                    h.orchestrator.report_completion(&session, &id, code).await.unwrap();
                }
            }

            h.orchestrator.shutdown(ShutdownMode::Detach).await.unwrap();
        });
    }
}
