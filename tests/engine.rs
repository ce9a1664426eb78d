use notegraph::analytics::PathResult;
use notegraph::config::EngineConfig;
use notegraph::model::{EdgeAttrs, GraphData, NodeAttrs};
use notegraph::protocol::EndReason;
use notegraph::worker::ExecutionMode;
use notegraph::{EngineEvent, EngineFacade, EngineState};

fn ring(n: usize) -> GraphData {
    let mut data = GraphData::new();
    for i in 0..n {
        data = data.with_node(format!("n{i:03}"), NodeAttrs::default());
    }
    for i in 0..n {
        let next = (i + 1) % n;
        data = data.with_edge(format!("e{i:03}"), format!("n{i:03}"), format!("n{next:03}"));
    }
    data
}

fn background_engine(nodes: usize) -> EngineFacade {
    let config = EngineConfig {
        worker_threshold: 10,
        ..EngineConfig::default()
    };
    let mut engine = EngineFacade::new(config).unwrap();
    engine.import(ring(nodes));
    engine
}

#[tokio::test]
async fn large_graph_runs_on_background_worker() {
    let mut engine = background_engine(40);
    let mut events = engine.subscribe();

    engine.init_simulation().unwrap();
    assert_eq!(engine.execution_mode(), Some(ExecutionMode::Background));

    let state = engine.settle(100_000).await;
    assert_eq!(state, EngineState::Converged);

    let events = events.drain();
    assert!(events.iter().any(|event| matches!(event, EngineEvent::Tick { .. })));
    assert!(events.iter().any(|event| matches!(
        event,
        EngineEvent::SimulationEnded {
            reason: EndReason::Converged,
            ..
        }
    )));
    assert!(
        engine
            .positions()
            .iter()
            .all(|position| position.x.is_finite() && position.y.is_finite())
    );
}

#[tokio::test]
async fn background_stop_freezes_positions() {
    let mut engine = background_engine(200);
    engine.init_simulation().unwrap();
    engine.stop_simulation().unwrap();
    let frozen = engine.positions();

    // Let the worker drain whatever it produced before the stop
    for _ in 0..20 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine.poll();
    }

    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.positions(), frozen);
}

#[tokio::test]
async fn mutation_during_background_run_still_converges() {
    let mut engine = background_engine(30);
    engine.init_simulation().unwrap();

    engine.add_node("extra", NodeAttrs::default());
    engine
        .add_edge("to-extra", "n000", "extra", EdgeAttrs::default())
        .unwrap();

    assert_eq!(engine.settle(100_000).await, EngineState::Converged);
    let extra = engine.store().node("extra").unwrap();
    let anchor = engine.store().node("n000").unwrap();
    let distance = (extra.position.x - anchor.position.x).hypot(extra.position.y - anchor.position.y);
    assert!(distance < 100.0);
}

#[tokio::test]
async fn subscription_receives_worker_analytics() {
    let mut engine = background_engine(20);
    let mut events = engine.subscribe();
    assert_eq!(engine.subscriber_count(), 1);

    engine.request_path("n000", "n005");
    let result = loop {
        engine.poll();
        if let Some(EngineEvent::PathReady(result)) = events.try_recv() {
            break result;
        }
        tokio::task::yield_now().await;
    };

    assert!(result.is_current(engine.version()));
    assert!(matches!(result.value, PathResult::Found { distance: 5, .. }));

    events.unsubscribe();
    assert_eq!(engine.subscriber_count(), 0);
}

#[tokio::test]
async fn subscription_ends_when_engine_is_dropped() {
    let engine = background_engine(5);
    let mut events = engine.subscribe();
    drop(engine);
    assert!(events.recv().await.is_none());
}
