//! Common test utilities and helper nodes

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod nodes;

use flowgraph_rs::graph::RenderExecutionModel;

/// Every execution model, synchronous first
pub const ALL_MODELS: [RenderExecutionModel; 4] = [
    RenderExecutionModel::Synchronous,
    RenderExecutionModel::SingleThreaded,
    RenderExecutionModel::MaximallyParallel,
    RenderExecutionModel::Islands,
];

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f32, b: f32, epsilon: f32) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
