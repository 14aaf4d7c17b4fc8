//! Per-cycle delta time source.

use crate::error::GraphResult;
use crate::graph::{
    Capability, DataOutput, Kernel, MessageContext, MessageInput, NodeDefinition, NodeDescription,
    RenderContext, UpdateContext,
};
use std::any::Any;
use std::time::Instant;

/// Publishes the seconds elapsed between consecutive updates.
///
/// The first update reports zero. Sending a value to
/// [`DeltaTime::FIXED_STEP`] switches to a constant step; a negative value
/// switches back to wall-clock time.
#[derive(Default)]
pub struct DeltaTime {
    last: Option<Instant>,
    fixed_step: Option<f32>,
}

impl DeltaTime {
    pub const FIXED_STEP: MessageInput<f32> = MessageInput::new(0);
    pub const DELTA: DataOutput<f32> = DataOutput::new(0);
}

impl NodeDefinition for DeltaTime {
    fn describe(desc: &mut NodeDescription) {
        desc.message_input(DeltaTime::FIXED_STEP, "fixed_step")
            .data_output(DeltaTime::DELTA, "delta_time")
            .capability(Capability::Kernel)
            .capability(Capability::MessageHandler);
    }

    fn handle_message(&mut self, _ctx: &mut MessageContext<'_>, message: &dyn Any) -> GraphResult<()> {
        if let Some(&step) = message.downcast_ref::<f32>() {
            self.fixed_step = (step >= 0.0).then_some(step);
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> GraphResult<()> {
        let now = Instant::now();
        let elapsed = self
            .last
            .replace(now)
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32());
        ctx.update_kernel_data(self.fixed_step.unwrap_or(elapsed))
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(DeltaKernel::default()))
    }
}

#[derive(Default)]
struct DeltaKernel {
    delta: f32,
}

impl Kernel for DeltaKernel {
    fn execute(&mut self, ctx: &mut RenderContext<'_>) -> anyhow::Result<()> {
        *ctx.output(DeltaTime::DELTA)? = self.delta;
        Ok(())
    }

    fn apply_data(&mut self, data: Box<dyn Any + Send>) -> anyhow::Result<()> {
        self.delta = *data
            .downcast::<f32>()
            .map_err(|_| anyhow::anyhow!("delta time kernel expects f32 data"))?;
        Ok(())
    }
}
