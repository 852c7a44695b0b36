//! Profile events and profiler metrics

mod common;

use common::HostFixture;
use taskforge::profiling::ProfileEventKind;
use taskforge::{
    DataTransferMode, ElementType, ExecutionPlan, ImmutableTaskGraph, LogicalObject, ProfilerType,
    TaskArg, TaskDescriptor, TaskGraph,
};

fn graph(a: &LogicalObject, b: &LogicalObject, c: &LogicalObject) -> ImmutableTaskGraph {
    TaskGraph::new("profiled")
        .transfer_to_device(DataTransferMode::EveryExecution, &[a, b])
        .task(
            "add",
            TaskDescriptor::new("vector_add"),
            [TaskArg::read(a), TaskArg::read(b), TaskArg::write(c)],
        )
        .transfer_to_host(DataTransferMode::EveryExecution, &[c])
        .snapshot()
        .unwrap()
}

#[test]
fn test_events_per_execution() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::filled(1.0f32, &[256]);
    let b = LogicalObject::filled(1.0f32, &[256]);
    let c = LogicalObject::zeros(ElementType::F32, &[256]);
    let mut plan = ExecutionPlan::new(fixture.runtime(), graph(&a, &b, &c))?;

    plan.execute()?;
    plan.execute()?;
    let events = plan.profiles()?;

    assert_eq!(events.len(), 8);
    let launches: Vec<_> = events
        .iter()
        .filter(|e| e.kind == ProfileEventKind::Launch)
        .collect();
    assert_eq!(launches.len(), 2);
    assert!(launches.iter().all(|e| e.label == "add" && e.bytes == 0));
    assert_eq!(launches[0].invocation, 1);
    assert_eq!(launches[1].invocation, 2);

    let copied_in: usize = events
        .iter()
        .filter(|e| e.kind == ProfileEventKind::CopyIn)
        .map(|e| e.bytes)
        .sum();
    assert_eq!(copied_in, 4 * 1024);
    Ok(())
}

#[test]
fn test_clear_profiles() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::filled(1.0f32, &[16]);
    let b = LogicalObject::filled(1.0f32, &[16]);
    let c = LogicalObject::zeros(ElementType::F32, &[16]);
    let mut plan = ExecutionPlan::new(fixture.runtime(), graph(&a, &b, &c))?;

    plan.execute()?;
    assert!(!plan.profiles()?.is_empty());
    plan.clear_profiles()?;
    assert!(plan.profiles()?.is_empty());

    plan.execute()?;
    assert_eq!(plan.profiles()?.len(), 4);
    Ok(())
}

#[test]
fn test_profiler_metrics() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::filled(1.0f32, &[128]);
    let b = LogicalObject::filled(1.0f32, &[128]);
    let c = LogicalObject::zeros(ElementType::F32, &[128]);
    let mut plan = ExecutionPlan::new(fixture.runtime(), graph(&a, &b, &c))?;
    plan.with_profiler();

    let result = plan.execute()?;
    assert!(result.is_profiler_enabled());
    let profiler = result.profiler();
    assert_eq!(profiler.get(ProfilerType::TotalCopyInSizeBytes), 1024);
    assert_eq!(profiler.get(ProfilerType::TotalCopyOutSizeBytes), 512);
    assert!(result.total_time() >= result.total_kernel_time());
    assert_eq!(result.task_kernel_time("add"), profiler.task_value("add", ProfilerType::KernelTime));

    let log: serde_json::Value = serde_json::from_str(&result.profile_log()?)?;
    assert_eq!(log["totals"]["TOTAL_COPY_IN_SIZE_BYTES"], 1024);
    assert!(log["tasks"]["add"].is_object());

    // Metrics describe the latest execution only
    let result = plan.execute()?;
    assert_eq!(result.profiler().get(ProfilerType::TotalCopyInSizeBytes), 1024);
    Ok(())
}

#[test]
fn test_profiler_disabled() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::filled(1.0f32, &[32]);
    let b = LogicalObject::filled(1.0f32, &[32]);
    let c = LogicalObject::zeros(ElementType::F32, &[32]);
    let mut plan = ExecutionPlan::new(fixture.runtime(), graph(&a, &b, &c))?;
    plan.with_profiler().without_profiler();

    let result = plan.execute()?;
    assert!(!result.is_profiler_enabled());
    assert!(result.profiler().is_empty());
    Ok(())
}
