use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mixmode_core::sim::{SimulatedHighBackend, SimulatedLowBackend};
use mixmode_core::transition::plan;
use mixmode_core::{
    CoordinatorConfig, Event, Frame, Origin, SessionFacade, State, SuspendContext, ThreadId,
};
use std::sync::Arc;

fn high_ctx() -> SuspendContext {
    SuspendContext::high(ThreadId(1), vec![Frame::new("Program.Main", Origin::High)])
}

fn low_ctx() -> SuspendContext {
    SuspendContext::low(ThreadId(1), vec![Frame::new("native_wait", Origin::Low)])
}

fn bench_transition_planning(c: &mut Criterion) {
    let stopped = State::BothStopped { low: low_ctx(), high: high_ctx() };
    let step = Event::HighStepRequested { context: high_ctx(), kind: mixmode_core::StepKind::Over };
    c.bench_function("plan_managed_step", |b| {
        b.iter(|| {
            let _ = black_box(plan(black_box(&stopped), black_box(&step)));
        })
    });

    c.bench_function("plan_illegal_pair", |b| {
        b.iter(|| {
            let rejected = plan(black_box(&State::BothRunning), black_box(&Event::ResumeRequested));
            let _ = black_box(rejected);
        })
    });
}

fn bench_stop_resume_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let low = Arc::new(SimulatedLowBackend::new());
    let high = Arc::new(SimulatedHighBackend::new());
    let facade = rt.block_on(async {
        let facade = SessionFacade::new(low.clone(), high.clone(), &CoordinatorConfig::default());
        facade.on_session_resumed(Origin::Low).await.expect("session start");
        facade
    });

    c.bench_function("stop_resume_round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            let machine = facade.machine();
            machine.submit(Event::StopRequested).committed().await.expect("stop");
            facade.on_position_reached(high_ctx()).await.expect("high stop");
            let merged = facade.on_position_reached(low_ctx()).await.expect("low stop");
            black_box(merged);
            facade.resume().await.expect("resume");
            low.clear_calls();
            high.clear_calls();
        })
    });
}

criterion_group!(benches, bench_transition_planning, bench_stop_resume_round_trip);
criterion_main!(benches);
