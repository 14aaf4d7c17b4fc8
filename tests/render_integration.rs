//! Integration tests for the render graph
//!
//! These tests validate what kernels observe across cycles:
//! - Propagation, aliasing and port arrays
//! - Buffer allocation and retained values
//! - Feedback latency and execution model equivalence
//! - Teardown after kernel faults

mod common;

use common::nodes::{Add, BufferTotal, Clock, Faulty, PoseSource, PoseTotal, Ramp};
use common::ALL_MODELS;
use flowgraph_rs::graph::{
    ConnectionKind, GraphValue, InputPortArrayId, InputSource, NodeSet, OutputPort,
    RenderExecutionModel,
};
use flowgraph_rs::nodes::{ArraySum, PassThrough};
use flowgraph_rs::GraphError;

type Pass = PassThrough<f32>;

#[test]
fn test_diamond() {
    let mut set = NodeSet::new();
    let clock = set.create::<Clock>().unwrap();
    let left = set.create::<Pass>().unwrap();
    let right = set.create::<Pass>().unwrap();
    let add = set.create::<Add>().unwrap();
    set.connect(clock, Clock::TIME, left, Pass::INPUT).unwrap();
    set.connect(clock, Clock::TIME, right, Pass::INPUT).unwrap();
    set.connect(left, Pass::OUTPUT, add, Add::LEFT).unwrap();
    set.connect(right, Pass::OUTPUT, add, Add::RIGHT).unwrap();
    set.send_message(add, Add::BIAS, 0.5).unwrap();

    let sum = set.request_readback(add, Add::SUM).unwrap();
    for cycle in 0..4 {
        set.update().unwrap();
        assert_eq!(set.read_value(&sum).unwrap(), 2.0 * cycle as f32 + 0.5);
    }
    assert_eq!(set.traversal_stats().nodes, 4);
    assert_eq!(set.traversal_stats().islands, 1);
}

#[test]
fn test_buffer_resize_allocates_fresh_storage() {
    let mut set = NodeSet::new();
    let ramp = set.create::<Ramp>().unwrap();

    set.set_buffer_size(ramp, Ramp::SAMPLES, 15).unwrap();
    set.update().unwrap();
    let first = set.output_buffer_info(ramp, Ramp::SAMPLES, 0).unwrap();
    assert!(first.allocation.is_some());
    assert_eq!(first.len, 15);
    assert_eq!(first.owner, ramp);

    set.send_message(ramp, Ramp::SIZE, 15).unwrap();
    set.update().unwrap();
    let second = set.output_buffer_info(ramp, Ramp::SAMPLES, 0).unwrap();
    assert_eq!(second.len, 15);
    assert_ne!(second.allocation, first.allocation);

    set.set_buffer_size(ramp, Ramp::SAMPLES, 0).unwrap();
    set.update().unwrap();
    let empty = set.output_buffer_info(ramp, Ramp::SAMPLES, 0).unwrap();
    assert_eq!(empty.allocation, None);
    assert_eq!(empty.len, 0);
}

#[test]
fn test_buffer_contents_reach_consumer() {
    let mut set = NodeSet::new();
    let ramp = set.create::<Ramp>().unwrap();
    let total = set.create::<BufferTotal>().unwrap();
    set.connect(ramp, Ramp::SAMPLES, total, BufferTotal::SAMPLES).unwrap();
    set.set_buffer_size(ramp, Ramp::SAMPLES, 4).unwrap();

    let samples = set.request_readback(ramp, Ramp::SAMPLES).unwrap();
    let sum = set.request_readback(total, BufferTotal::TOTAL).unwrap();
    set.update().unwrap();
    assert_eq!(set.read_buffer(&samples).unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    assert_eq!(set.read_value(&sum).unwrap(), 6.0);

    set.update().unwrap();
    assert_eq!(set.read_value(&sum).unwrap(), 10.0);
}

#[test]
fn test_array_slots_alias_their_own_producer() {
    let mut set = NodeSet::new();
    let first = set.create::<Pass>().unwrap();
    let second = set.create::<Pass>().unwrap();
    let sum = set.create::<ArraySum>().unwrap();
    set.set_port_array_size(sum, ArraySum::INPUTS, 2).unwrap();
    set.connect_indexed(first, Pass::OUTPUT, sum, ArraySum::INPUTS, 0).unwrap();
    set.connect_indexed(second, Pass::OUTPUT, sum, ArraySum::INPUTS, 1).unwrap();
    set.set_data(first, Pass::INPUT, 1.0).unwrap();
    set.set_data(second, Pass::INPUT, 2.0).unwrap();
    let total = set.request_readback(sum, ArraySum::SUM).unwrap();
    set.update().unwrap();

    let slot = |index| InputPortArrayId::slot(ArraySum::INPUTS.port(), index);
    let output = Pass::OUTPUT.id();
    assert!(set.aliases(sum, slot(0), first, output).unwrap());
    assert!(set.aliases(sum, slot(1), second, output).unwrap());
    assert!(!set.aliases(sum, slot(0), second, output).unwrap());
    assert!(!set.aliases(sum, slot(1), first, output).unwrap());
    assert_eq!(
        set.input_source(sum, slot(1)).unwrap(),
        InputSource::Connected {
            source: second,
            port: output
        }
    );
    assert_eq!(set.read_value(&total).unwrap(), 3.0);
}

#[test]
fn test_shrinking_array_drops_assigned_slots() {
    let mut set = NodeSet::new();
    let sum = set.create::<ArraySum>().unwrap();
    set.set_port_array_size(sum, ArraySum::INPUTS, 2).unwrap();
    set.set_data_indexed(sum, ArraySum::INPUTS, 0, 1.0).unwrap();
    set.set_data_indexed(sum, ArraySum::INPUTS, 1, 5.0).unwrap();
    let total = set.request_readback(sum, ArraySum::SUM).unwrap();
    set.update().unwrap();
    assert_eq!(set.read_value(&total).unwrap(), 6.0);

    // Value assigned in an earlier cycle
    set.set_port_array_size(sum, ArraySum::INPUTS, 1).unwrap();
    set.set_port_array_size(sum, ArraySum::INPUTS, 2).unwrap();
    set.update().unwrap();
    assert_eq!(set.read_value(&total).unwrap(), 1.0);
    let slot = InputPortArrayId::slot(ArraySum::INPUTS.port(), 1);
    assert_eq!(set.input_source(sum, slot).unwrap(), InputSource::Blank);

    // Value assigned earlier in the same cycle
    set.set_data_indexed(sum, ArraySum::INPUTS, 1, 7.0).unwrap();
    set.set_port_array_size(sum, ArraySum::INPUTS, 1).unwrap();
    set.set_port_array_size(sum, ArraySum::INPUTS, 2).unwrap();
    set.update().unwrap();
    assert_eq!(set.read_value(&total).unwrap(), 1.0);

    // Assignments after the last resize stick
    set.set_port_array_size(sum, ArraySum::INPUTS, 1).unwrap();
    set.set_port_array_size(sum, ArraySum::INPUTS, 2).unwrap();
    set.set_data_indexed(sum, ArraySum::INPUTS, 1, 3.0).unwrap();
    set.update().unwrap();
    assert_eq!(set.read_value(&total).unwrap(), 4.0);
}

#[test]
fn test_retained_value_survives_disconnect() {
    let mut set = NodeSet::new();
    let source = set.create::<Pass>().unwrap();
    let kept = set.create::<Pass>().unwrap();
    let dropped = set.create::<Pass>().unwrap();
    set.connect(source, Pass::OUTPUT, kept, Pass::INPUT).unwrap();
    set.connect(source, Pass::OUTPUT, dropped, Pass::INPUT).unwrap();
    set.set_data(source, Pass::INPUT, 7.25).unwrap();
    let kept_value = set.request_readback(kept, Pass::OUTPUT).unwrap();
    let dropped_value = set.request_readback(dropped, Pass::OUTPUT).unwrap();
    set.update().unwrap();
    assert_eq!(set.read_value(&kept_value).unwrap(), 7.25);

    set.disconnect_and_retain(source, Pass::OUTPUT, kept, Pass::INPUT).unwrap();
    set.disconnect(source, Pass::OUTPUT, dropped, Pass::INPUT).unwrap();
    set.set_data(source, Pass::INPUT, 9.0).unwrap();
    set.update().unwrap();

    assert_eq!(set.read_value(&kept_value).unwrap().to_bits(), 7.25f32.to_bits());
    assert_eq!(set.input_source_of(kept, Pass::INPUT).unwrap(), InputSource::Owned);
    assert_eq!(set.read_value(&dropped_value).unwrap(), 0.0);
    assert_eq!(set.input_source_of(dropped, Pass::INPUT).unwrap(), InputSource::Blank);

    set.set_data(kept, Pass::INPUT, 1.0).unwrap();
    set.update().unwrap();
    assert_eq!(set.read_value(&kept_value).unwrap(), 1.0);
}

#[test]
fn test_retaining_a_buffer_edge_is_rejected() {
    let mut set = NodeSet::new();
    let ramp = set.create::<Ramp>().unwrap();
    let total = set.create::<BufferTotal>().unwrap();
    set.connect(ramp, Ramp::SAMPLES, total, BufferTotal::SAMPLES).unwrap();
    let version = set.topology_version();

    let err = set
        .disconnect_and_retain(ramp, Ramp::SAMPLES, total, BufferTotal::SAMPLES)
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidOperation(_)));
    assert_eq!(set.connection_count(), 1);
    assert_eq!(set.topology_version(), version);
}

#[test]
fn test_feedback_reads_previous_cycle() {
    for model in ALL_MODELS {
        let mut set = NodeSet::new();
        set.set_execution_model(model);
        let clock = set.create::<Clock>().unwrap();
        let delayed = set.create::<Pass>().unwrap();
        set.connect_with(clock, Clock::TIME, delayed, Pass::INPUT, ConnectionKind::Feedback)
            .unwrap();
        let now = set.request_readback(clock, Clock::TIME).unwrap();
        let before = set.request_readback(delayed, Pass::OUTPUT).unwrap();

        set.update().unwrap();
        assert_eq!(set.read_value(&before).unwrap(), 0.0);
        for cycle in 1..5 {
            set.update().unwrap();
            assert_eq!(set.read_value(&now).unwrap(), cycle as f32, "{:?}", model);
            assert_eq!(set.read_value(&before).unwrap(), (cycle - 1) as f32, "{:?}", model);
        }
        assert_eq!(
            set.input_source_of(delayed, Pass::INPUT).unwrap(),
            InputSource::Feedback {
                source: clock,
                port: Clock::TIME.id()
            }
        );
    }
}

struct Probes {
    diamond: GraphValue<f32>,
    array: GraphValue<f32>,
    buffer: GraphValue<f32>,
}

fn build_mixed_graph(set: &mut NodeSet) -> Probes {
    let clock = set.create::<Clock>().unwrap();
    let left = set.create::<Pass>().unwrap();
    let add = set.create::<Add>().unwrap();
    set.connect(clock, Clock::TIME, left, Pass::INPUT).unwrap();
    set.connect(left, Pass::OUTPUT, add, Add::LEFT).unwrap();
    set.connect(clock, Clock::TIME, add, Add::RIGHT).unwrap();
    set.send_message(add, Add::BIAS, 3.0).unwrap();

    let sum = set.create::<ArraySum>().unwrap();
    set.send_message(sum, ArraySum::COUNT, 3).unwrap();
    set.connect_indexed(add, Add::SUM, sum, ArraySum::INPUTS, 0).unwrap();
    set.connect_indexed(clock, Clock::TIME, sum, ArraySum::INPUTS, 2).unwrap();
    set.set_data_indexed(sum, ArraySum::INPUTS, 1, 100.0).unwrap();

    let ramp = set.create::<Ramp>().unwrap();
    let total = set.create::<BufferTotal>().unwrap();
    set.send_message(ramp, Ramp::SIZE, 5).unwrap();
    set.connect(ramp, Ramp::SAMPLES, total, BufferTotal::SAMPLES).unwrap();

    Probes {
        diamond: set.request_readback(add, Add::SUM).unwrap(),
        array: set.request_readback(sum, ArraySum::SUM).unwrap(),
        buffer: set.request_readback(total, BufferTotal::TOTAL).unwrap(),
    }
}

#[test]
fn test_execution_models_agree() {
    let mut results = Vec::new();
    for model in ALL_MODELS {
        let mut set = NodeSet::new();
        set.set_execution_model(model);
        let probes = build_mixed_graph(&mut set);
        let mut trace = Vec::new();
        for _ in 0..4 {
            set.update().unwrap();
            trace.push((
                set.read_value(&probes.diamond).unwrap(),
                set.read_value(&probes.array).unwrap(),
                set.read_value(&probes.buffer).unwrap(),
            ));
        }
        assert_eq!(set.traversal_stats().islands, 2);
        results.push(trace);
    }

    assert_eq!(results[0][3], (9.0, 112.0, 25.0));
    for trace in &results[1..] {
        assert_eq!(trace, &results[0]);
    }
}

#[test]
fn test_switching_model_between_cycles() {
    let mut set = NodeSet::new();
    let probes = build_mixed_graph(&mut set);
    for (cycle, model) in ALL_MODELS.iter().cycle().take(8).enumerate() {
        set.set_execution_model(*model);
        set.update().unwrap();
        assert_eq!(set.read_value(&probes.diamond).unwrap(), 2.0 * cycle as f32 + 3.0);
    }
}

#[test]
fn test_create_and_destroy_in_one_cycle() {
    let mut set = NodeSet::new();
    let node = set.create::<Clock>().unwrap();
    set.destroy(node).unwrap();
    set.update().unwrap();
    assert_eq!(set.render_node_count().unwrap(), 0);
}

#[test]
fn test_kernel_panic_tears_down_render_world() {
    let mut set = NodeSet::new();
    set.set_execution_model(RenderExecutionModel::MaximallyParallel);
    let faulty = set.create::<Faulty>().unwrap();
    let bystander = set.create::<Clock>().unwrap();
    let time = set.request_readback(bystander, Clock::TIME).unwrap();
    set.update().unwrap();
    assert_eq!(set.render_node_count().unwrap(), 2);

    set.set_data(faulty, Faulty::TRIGGER, 1).unwrap();
    set.update().unwrap();
    let err = set.sync().unwrap_err();
    assert!(err.is_render_fault());
    assert!(err.to_string().contains("kernel exploded"));
    assert!(matches!(err.root(), GraphError::KernelFault { node, .. } if *node == faulty));

    // Simulation side is untouched, render side is empty
    assert_eq!(set.render_node_count().unwrap(), 0);
    assert!(set.exists(faulty));
    assert_eq!(set.node_count(), 2);
    assert!(set.read_value(&time).is_err());
    set.update().unwrap();
    assert!(set.read_value(&time).is_err());

    // Recreated nodes run again
    set.destroy(bystander).unwrap();
    let fresh = set.create::<Clock>().unwrap();
    let time = set.request_readback(fresh, Clock::TIME).unwrap();
    set.update().unwrap();
    assert_eq!(set.render_node_count().unwrap(), 1);
    assert!(set.read_value(&time).is_ok());
}

#[test]
fn test_synchronous_fault_surfaces_from_update() {
    let mut set = NodeSet::new();
    set.set_execution_model(RenderExecutionModel::Synchronous);
    let faulty = set.create::<Faulty>().unwrap();
    set.set_data(faulty, Faulty::TRIGGER, -2).unwrap();

    let err = set.update().unwrap_err();
    assert!(err.to_string().contains("refused trigger -2"));
    assert_eq!(set.render_node_count().unwrap(), 0);
    assert!(set.update().is_ok());
}

#[test]
fn test_single_threaded_fault_surfaces_at_next_join() {
    let mut set = NodeSet::new();
    set.set_execution_model(RenderExecutionModel::SingleThreaded);
    let faulty = set.create::<Faulty>().unwrap();
    set.set_data(faulty, Faulty::TRIGGER, -1).unwrap();

    set.update().unwrap();
    let err = set.sync().unwrap_err();
    assert!(err.to_string().contains("refused trigger -1"));
    assert_eq!(set.render_node_count().unwrap(), 0);
}

#[test]
fn test_node_created_while_fault_pending_is_mirrored_next_cycle() {
    let mut set = NodeSet::new();
    set.set_execution_model(RenderExecutionModel::MaximallyParallel);
    let faulty = set.create::<Faulty>().unwrap();
    set.set_data(faulty, Faulty::TRIGGER, -1).unwrap();
    set.update().unwrap();

    let late = set.create::<Clock>().unwrap();
    let time = set.request_readback(late, Clock::TIME).unwrap();
    assert!(set.update().unwrap_err().is_render_fault());
    assert_eq!(set.render_node_count().unwrap(), 0);

    set.update().unwrap();
    assert_eq!(set.render_node_count().unwrap(), 1);
    assert!(set.read_value(&time).is_ok());
    let out = set.request_readback(faulty, Faulty::OUT).unwrap();
    assert!(set.read_value(&out).is_err());
}

#[test]
fn test_nested_buffers_resize_and_resolve() {
    for model in ALL_MODELS {
        let mut set = NodeSet::new();
        set.set_execution_model(model);
        let source = set.create::<PoseSource>().unwrap();
        let total = set.create::<PoseTotal>().unwrap();
        set.connect(source, PoseSource::POSE, total, PoseTotal::POSE).unwrap();
        set.set_sub_buffer_size(source, PoseSource::POSE, PoseSource::TRANSLATIONS, 4)
            .unwrap();
        set.set_sub_buffer_size(source, PoseSource::POSE, PoseSource::WEIGHTS, 3)
            .unwrap();
        let sum = set.request_readback(total, PoseTotal::TOTAL).unwrap();

        set.update().unwrap();
        let translations = set
            .output_buffer_info(source, PoseSource::POSE, PoseSource::TRANSLATIONS)
            .unwrap();
        let weights = set
            .output_buffer_info(source, PoseSource::POSE, PoseSource::WEIGHTS)
            .unwrap();
        assert_eq!(translations.len, 4);
        assert_eq!(weights.len, 3);
        assert_eq!(translations.owner, source);
        assert_eq!(weights.owner, source);
        assert!(translations.allocation.is_some());
        assert!(weights.allocation.is_some());
        assert_ne!(translations.allocation, weights.allocation);
        // 0+1+2+3 plus 10+20+30
        assert_eq!(set.read_value(&sum).unwrap(), 66.0, "{:?}", model);

        set.set_sub_buffer_size(source, PoseSource::POSE, PoseSource::WEIGHTS, 1)
            .unwrap();
        set.update().unwrap();
        let resized = set
            .output_buffer_info(source, PoseSource::POSE, PoseSource::WEIGHTS)
            .unwrap();
        assert_eq!(resized.len, 1);
        assert_ne!(resized.allocation, weights.allocation);
        assert_eq!(
            set.output_buffer_info(source, PoseSource::POSE, PoseSource::TRANSLATIONS)
                .unwrap()
                .allocation,
            translations.allocation
        );
        assert_eq!(set.read_value(&sum).unwrap(), 10.0 + 10.0, "{:?}", model);
    }
}
