//! End-to-end execution of task graphs on the emulated backend

mod common;

use common::{ramp, HostFixture};
use taskforge::{
    DataTransferMode, ElementType, EngineState, ExecutionPlan, GridScheduler, LogicalObject,
    TaskArg, TaskDescriptor, TaskForgeError, TaskGraph, WorkerGrid,
};

fn vector_add_graph(
    a: &LogicalObject,
    b: &LogicalObject,
    c: &LogicalObject,
) -> anyhow::Result<taskforge::ImmutableTaskGraph> {
    Ok(TaskGraph::new("s0")
        .transfer_to_device(DataTransferMode::FirstExecution, &[a, b])
        .task(
            "t0",
            TaskDescriptor::new("vector_add"),
            [TaskArg::read(a), TaskArg::read(b), TaskArg::write(c)],
        )
        .transfer_to_host(DataTransferMode::EveryExecution, &[c])
        .snapshot()?)
}

#[test]
fn test_vector_add_4096() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::filled(1.0f32, &[4096]);
    let b = LogicalObject::filled(2.0f32, &[4096]);
    let c = LogicalObject::zeros(ElementType::F32, &[4096]);

    let mut plan = ExecutionPlan::new(fixture.runtime(), vector_add_graph(&a, &b, &c)?)?;
    plan.execute()?;

    assert!(c.to_vec::<f32>()?.iter().all(|&v| v == 3.0));
    let stats = fixture.stats()?;
    assert_eq!(stats.launch_count, 1);
    assert_eq!(stats.copy_in_count, 2);
    assert_eq!(stats.copy_out_count, 1);
    assert_eq!(plan.engine_state()?, EngineState::Completed);
    Ok(())
}

#[test]
fn test_repeated_execution_is_idempotent() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::from_slice(&ramp(256, 0.0));
    let b = LogicalObject::from_slice(&ramp(256, 10.0));
    let c = LogicalObject::zeros(ElementType::F32, &[256]);

    let mut plan = ExecutionPlan::new(fixture.runtime(), vector_add_graph(&a, &b, &c)?)?;
    plan.execute()?;
    let first = c.to_vec::<f32>()?;
    plan.execute()?;

    assert_eq!(c.to_vec::<f32>()?, first);
    assert_eq!(first[0], 10.0);
    assert_eq!(first[255], 520.0);
    // FirstExecution inputs are copied once, outputs every time
    let stats = fixture.stats()?;
    assert_eq!(stats.copy_in_count, 2);
    assert_eq!(stats.copy_out_count, 2);
    assert_eq!(plan.engine_stats()?.executions, 2);
    Ok(())
}

#[test]
fn test_every_execution_input_picks_up_host_changes() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let x = LogicalObject::filled(1.0f32, &[64]);
    let y = LogicalObject::zeros(ElementType::F32, &[64]);
    let graph = TaskGraph::new("s0")
        .transfer_to_device(DataTransferMode::EveryExecution, &[&x])
        .task("copy", TaskDescriptor::new("copy"), [TaskArg::read(&x), TaskArg::write(&y)])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&y])
        .snapshot()?;

    let mut plan = ExecutionPlan::new(fixture.runtime(), graph)?;
    plan.execute()?;
    assert_eq!(y.to_vec::<f32>()?, vec![1.0; 64]);

    x.write(&[4.0f32; 64])?;
    plan.execute()?;
    assert_eq!(y.to_vec::<f32>()?, vec![4.0; 64]);
    Ok(())
}

#[test]
fn test_chained_tasks_with_scalars() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let x = LogicalObject::from_slice(&ramp(128, 1.0));
    let y = LogicalObject::filled(1.0f32, &[128]);
    let graph = TaskGraph::new("s0")
        .transfer_to_device(DataTransferMode::EveryExecution, &[&x, &y])
        .task(
            "axpy",
            TaskDescriptor::new("saxpy"),
            [TaskArg::scalar(2.0f32), TaskArg::read(&x), TaskArg::read_write(&y)],
        )
        .task("scale", TaskDescriptor::new("scale"), [TaskArg::read_write(&y), TaskArg::scalar(0.5f32)])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&y])
        .snapshot()?;

    let mut plan = ExecutionPlan::new(fixture.runtime(), graph)?;
    plan.execute()?;

    let expected: Vec<f32> = ramp(128, 1.0).iter().map(|x| (2.0 * x + 1.0) * 0.5).collect();
    assert_eq!(y.to_vec::<f32>()?, expected);
    Ok(())
}

#[test]
fn test_constant_only_task() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let out = LogicalObject::zeros(ElementType::F32, &[32]);
    let graph = TaskGraph::new("s0")
        .task("fill", TaskDescriptor::new("fill"), [TaskArg::write(&out), TaskArg::scalar(7.0f32)])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&out])
        .snapshot()?;

    let mut plan = ExecutionPlan::new(fixture.runtime(), graph)?;
    plan.execute()?;

    assert_eq!(out.to_vec::<f32>()?, vec![7.0; 32]);
    assert_eq!(fixture.stats()?.copy_in_count, 0);
    Ok(())
}

#[test]
fn test_empty_graph_executes() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let graph = TaskGraph::new("empty").snapshot()?;
    let mut plan = ExecutionPlan::new(fixture.runtime(), graph)?;

    plan.execute()?;
    assert_eq!(fixture.stats()?.launch_count, 0);
    Ok(())
}

#[test]
fn test_grid_scheduler_limits_work_items() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let out = LogicalObject::filled(-1i32, &[16]);
    let graph = TaskGraph::new("s0")
        .transfer_to_device(DataTransferMode::EveryExecution, &[&out])
        .task("iota", TaskDescriptor::new("iota"), [TaskArg::read_write(&out)])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&out])
        .snapshot()?;

    let mut plan = ExecutionPlan::new(fixture.runtime(), graph)?;
    plan.with_grid_scheduler(GridScheduler::new().with("iota", WorkerGrid::new_1d(8)));
    plan.execute()?;

    let values = out.to_vec::<i32>()?;
    assert_eq!(&values[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
    assert!(values[8..].iter().all(|&v| v == -1));
    Ok(())
}

#[test]
fn test_persisted_object_stays_on_device() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let counter = LogicalObject::zeros(ElementType::I32, &[8]);
    let graph = TaskGraph::new("s0")
        .transfer_to_device(DataTransferMode::FirstExecution, &[&counter])
        .task("inc", TaskDescriptor::new("increment"), [TaskArg::read_write(&counter)])
        .persist_on_device(&[&counter])
        .snapshot()?;

    let mut plan = ExecutionPlan::new(fixture.runtime(), graph)?;
    plan.execute()?;
    plan.execute()?;
    let result = plan.execute()?;

    // Nothing has been copied back yet
    assert_eq!(counter.to_vec::<i32>()?, vec![0; 8]);
    result.transfer_to_host(&[&counter])?;
    assert_eq!(counter.to_vec::<i32>()?, vec![3; 8]);
    assert_eq!(fixture.stats()?.copy_in_count, 1);
    Ok(())
}

#[test]
fn test_user_managed_output() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let x = LogicalObject::filled(3.0f32, &[16]);
    let y = LogicalObject::zeros(ElementType::F32, &[16]);
    let graph = TaskGraph::new("s0")
        .transfer_to_device(DataTransferMode::EveryExecution, &[&x])
        .task("copy", TaskDescriptor::new("copy"), [TaskArg::read(&x), TaskArg::write(&y)])
        .transfer_to_host(DataTransferMode::UserManaged, &[&y])
        .snapshot()?;

    let mut plan = ExecutionPlan::new(fixture.runtime(), graph)?;
    let result = plan.execute()?;
    assert_eq!(fixture.stats()?.copy_out_count, 0);
    assert_eq!(y.to_vec::<f32>()?, vec![0.0; 16]);

    result.transfer_to_host(&[&y])?;
    assert_eq!(y.to_vec::<f32>()?, vec![3.0; 16]);
    assert_eq!(fixture.stats()?.copy_out_count, 1);

    let stranger = LogicalObject::zeros(ElementType::F32, &[16]);
    assert!(matches!(
        result.transfer_to_host(&[&stranger]).unwrap_err(),
        TaskForgeError::ObjectNotFound(_)
    ));
    Ok(())
}

#[test]
fn test_warm_up_compiles_before_execution() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::filled(1.0f32, &[64]);
    let b = LogicalObject::filled(1.0f32, &[64]);
    let c = LogicalObject::zeros(ElementType::F32, &[64]);

    let mut plan = ExecutionPlan::new(fixture.runtime(), vector_add_graph(&a, &b, &c)?)?;
    plan.with_warm_up()?;
    assert_eq!(plan.engine_stats()?.kernels.entries, 1);
    assert_eq!(fixture.stats()?.launch_count, 0);

    plan.execute()?;
    assert_eq!(c.to_vec::<f32>()?, vec![2.0; 64]);
    assert_eq!(plan.engine_stats()?.kernels.entries, 1);
    Ok(())
}

#[test]
fn test_free_device_memory_then_execute_again() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::filled(1.0f32, &[64]);
    let b = LogicalObject::filled(2.0f32, &[64]);
    let c = LogicalObject::zeros(ElementType::F32, &[64]);

    let mut plan = ExecutionPlan::new(fixture.runtime(), vector_add_graph(&a, &b, &c)?)?;
    plan.execute()?;
    plan.free_device_memory()?;
    assert_eq!(plan.engine_stats()?.allocated_bytes, 0);

    c.write(&[0.0f32; 64])?;
    plan.execute()?;
    assert_eq!(c.to_vec::<f32>()?, vec![3.0; 64]);
    Ok(())
}

#[test]
fn test_execute_after_shutdown_fails() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1)?;
    let a = LogicalObject::filled(1.0f32, &[8]);
    let b = LogicalObject::filled(1.0f32, &[8]);
    let c = LogicalObject::zeros(ElementType::F32, &[8]);
    let mut plan = ExecutionPlan::new(fixture.runtime(), vector_add_graph(&a, &b, &c)?)?;

    fixture.runtime().shutdown()?;
    fixture.runtime().shutdown()?;
    assert!(plan.execute().is_err());
    Ok(())
}
