//! Node definitions shared by the integration tests

use flowgraph_rs::graph::{
    Buffer, BufferDescription, Capability, DataInput, DataOutput, DestroyContext, InitContext,
    Kernel, MessageContext, MessageInput, MessageOutput, NodeDefinition, NodeDescription,
    NodeHandle, PortData, RenderContext,
};
use flowgraph_rs::GraphResult;
use std::any::Any;

/// Stores every message and forwards it plus `delta`.
#[derive(Default)]
pub struct Accumulator {
    pub contents: i32,
    pub delta: i32,
}

impl Accumulator {
    pub const INPUT: MessageInput<i32> = MessageInput::new(0);
    pub const OUTPUT: MessageOutput<i32> = MessageOutput::new(0);
}

impl NodeDefinition for Accumulator {
    fn describe(desc: &mut NodeDescription) {
        desc.message_input(Accumulator::INPUT, "input")
            .message_output(Accumulator::OUTPUT, "output")
            .capability(Capability::MessageHandler);
    }

    fn handle_message(&mut self, ctx: &mut MessageContext<'_>, message: &dyn Any) -> GraphResult<()> {
        if let Some(&value) = message.downcast_ref::<i32>() {
            self.contents = value;
            ctx.emit(Accumulator::OUTPUT, value + self.delta)?;
        }
        Ok(())
    }
}

/// Wraps an [`Accumulator`] and forwards both of its ports to it.
///
/// Messages sent to [`Composite::POKE`] are emitted on the composite's own
/// (forwarded) output.
#[derive(Default)]
pub struct Composite {
    pub inner: NodeHandle,
}

impl Composite {
    pub const POKE: MessageInput<i32> = MessageInput::new(1);
}

impl NodeDefinition for Composite {
    fn describe(desc: &mut NodeDescription) {
        desc.message_input(Accumulator::INPUT, "input")
            .message_input(Composite::POKE, "poke")
            .message_output(Accumulator::OUTPUT, "output")
            .capability(Capability::MessageHandler);
    }

    fn handle_message(&mut self, ctx: &mut MessageContext<'_>, message: &dyn Any) -> GraphResult<()> {
        match message.downcast_ref::<i32>() {
            Some(&value) => ctx.emit(Accumulator::OUTPUT, value),
            None => Ok(()),
        }
    }

    fn init(&mut self, ctx: &mut InitContext<'_>) -> GraphResult<()> {
        let inner = ctx.set().create::<Accumulator>()?;
        self.inner = inner;
        ctx.forward_input(Accumulator::INPUT, inner, Accumulator::INPUT)?;
        ctx.forward_output(Accumulator::OUTPUT, inner, Accumulator::OUTPUT)
    }

    fn destroy(&mut self, ctx: &mut DestroyContext<'_>) -> GraphResult<()> {
        ctx.destroy(self.inner)
    }
}

/// Writes the cycle index to its output.
#[derive(Default)]
pub struct Clock;

impl Clock {
    pub const TIME: DataOutput<f32> = DataOutput::new(0);
}

impl NodeDefinition for Clock {
    fn describe(desc: &mut NodeDescription) {
        desc.data_output(Clock::TIME, "time")
            .capability(Capability::Kernel);
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let cycle = ctx.cycle() as f32;
            *ctx.output(Clock::TIME)? = cycle;
            Ok(())
        }))
    }
}

/// `left + right + bias`, with the bias delivered as kernel data.
#[derive(Default)]
pub struct Add;

impl Add {
    pub const LEFT: DataInput<f32> = DataInput::new(0);
    pub const RIGHT: DataInput<f32> = DataInput::new(1);
    pub const BIAS: MessageInput<f32> = MessageInput::new(2);
    pub const SUM: DataOutput<f32> = DataOutput::new(0);
}

impl NodeDefinition for Add {
    fn describe(desc: &mut NodeDescription) {
        desc.data_input(Add::LEFT, "left")
            .data_input(Add::RIGHT, "right")
            .message_input(Add::BIAS, "bias")
            .data_output(Add::SUM, "sum")
            .capability(Capability::Kernel)
            .capability(Capability::MessageHandler);
    }

    fn handle_message(&mut self, ctx: &mut MessageContext<'_>, message: &dyn Any) -> GraphResult<()> {
        if let Some(&bias) = message.downcast_ref::<f32>() {
            ctx.update_kernel_data(bias)?;
        }
        Ok(())
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(AddKernel::default()))
    }
}

#[derive(Default)]
struct AddKernel {
    bias: f32,
}

impl Kernel for AddKernel {
    fn execute(&mut self, ctx: &mut RenderContext<'_>) -> anyhow::Result<()> {
        let sum = ctx.input(Add::LEFT)? + ctx.input(Add::RIGHT)? + self.bias;
        *ctx.output(Add::SUM)? = sum;
        Ok(())
    }

    fn apply_data(&mut self, data: Box<dyn Any + Send>) -> anyhow::Result<()> {
        self.bias = *data
            .downcast::<f32>()
            .map_err(|_| anyhow::anyhow!("bias must be f32"))?;
        Ok(())
    }
}

/// Fills its buffer output with `index + cycle`.
#[derive(Default)]
pub struct Ramp;

impl Ramp {
    pub const SIZE: MessageInput<usize> = MessageInput::new(0);
    pub const SAMPLES: DataOutput<Buffer<f32>> = DataOutput::new(0);
}

impl NodeDefinition for Ramp {
    fn describe(desc: &mut NodeDescription) {
        desc.message_input(Ramp::SIZE, "size")
            .data_output(Ramp::SAMPLES, "samples")
            .capability(Capability::Kernel)
            .capability(Capability::MessageHandler);
    }

    fn handle_message(&mut self, ctx: &mut MessageContext<'_>, message: &dyn Any) -> GraphResult<()> {
        if let Some(&size) = message.downcast_ref::<usize>() {
            ctx.set_buffer_size(Ramp::SAMPLES, size)?;
        }
        Ok(())
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let cycle = ctx.cycle() as f32;
            for (i, sample) in ctx.output_buffer(Ramp::SAMPLES)?.iter_mut().enumerate() {
                *sample = i as f32 + cycle;
            }
            Ok(())
        }))
    }
}

/// Sums a buffer input.
#[derive(Default)]
pub struct BufferTotal;

impl BufferTotal {
    pub const SAMPLES: DataInput<Buffer<f32>> = DataInput::new(0);
    pub const TOTAL: DataOutput<f32> = DataOutput::new(0);
}

impl NodeDefinition for BufferTotal {
    fn describe(desc: &mut NodeDescription) {
        desc.data_input(BufferTotal::SAMPLES, "samples")
            .data_output(BufferTotal::TOTAL, "total")
            .capability(Capability::Kernel);
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let total = ctx.input_buffer(BufferTotal::SAMPLES)?.iter().sum::<f32>();
            *ctx.output(BufferTotal::TOTAL)? = total;
            Ok(())
        }))
    }
}

/// Panics when its trigger is positive and fails when it is negative.
#[derive(Default)]
pub struct Faulty;

impl Faulty {
    pub const TRIGGER: DataInput<i32> = DataInput::new(0);
    pub const OUT: DataOutput<i32> = DataOutput::new(0);
}

impl NodeDefinition for Faulty {
    fn describe(desc: &mut NodeDescription) {
        desc.data_input(Faulty::TRIGGER, "trigger")
            .data_output(Faulty::OUT, "out")
            .capability(Capability::Kernel);
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let trigger = *ctx.input(Faulty::TRIGGER)?;
            if trigger > 0 {
                panic!("kernel exploded");
            }
            if trigger < 0 {
                anyhow::bail!("kernel refused trigger {}", trigger);
            }
            *ctx.output(Faulty::OUT)? = trigger;
            Ok(())
        }))
    }
}

/// Aggregate value carrying two independently sized buffers.
#[derive(Clone, Default)]
pub struct Pose {
    pub translations: Buffer<f32>,
    pub weights: Buffer<u32>,
}

impl PortData for Pose {
    const BUFFER_FIELDS: usize = 2;

    fn buffer_field(&self, field: usize) -> Option<&BufferDescription> {
        match field {
            0 => Some(self.translations.description()),
            1 => Some(self.weights.description()),
            _ => None,
        }
    }

    fn buffer_field_mut(&mut self, field: usize) -> Option<&mut BufferDescription> {
        match field {
            0 => Some(self.translations.description_mut()),
            1 => Some(self.weights.description_mut()),
            _ => None,
        }
    }
}

/// Writes `index + cycle` into the translations and `(index + 1) * 10` into the weights.
#[derive(Default)]
pub struct PoseSource;

impl PoseSource {
    pub const POSE: DataOutput<Pose> = DataOutput::new(0);
    pub const TRANSLATIONS: usize = 0;
    pub const WEIGHTS: usize = 1;
}

impl NodeDefinition for PoseSource {
    fn describe(desc: &mut NodeDescription) {
        desc.data_output(PoseSource::POSE, "pose")
            .capability(Capability::Kernel);
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let cycle = ctx.cycle() as f32;
            let translations =
                ctx.output_sub_buffer::<Pose, f32>(PoseSource::POSE, PoseSource::TRANSLATIONS)?;
            for (i, t) in translations.iter_mut().enumerate() {
                *t = i as f32 + cycle;
            }
            let weights = ctx.output_sub_buffer::<Pose, u32>(PoseSource::POSE, PoseSource::WEIGHTS)?;
            for (i, w) in weights.iter_mut().enumerate() {
                *w = (i as u32 + 1) * 10;
            }
            Ok(())
        }))
    }
}

/// Sums both buffers of a [`Pose`] input.
#[derive(Default)]
pub struct PoseTotal;

impl PoseTotal {
    pub const POSE: DataInput<Pose> = DataInput::new(0);
    pub const TOTAL: DataOutput<f32> = DataOutput::new(0);
}

impl NodeDefinition for PoseTotal {
    fn describe(desc: &mut NodeDescription) {
        desc.data_input(PoseTotal::POSE, "pose")
            .data_output(PoseTotal::TOTAL, "total")
            .capability(Capability::Kernel);
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let pose = ctx.input(PoseTotal::POSE)?.clone();
            let translations = ctx.resolve(&pose.translations)?.iter().sum::<f32>();
            let weights = ctx.resolve(&pose.weights)?.iter().sum::<u32>();
            *ctx.output(PoseTotal::TOTAL)? = translations + weights as f32;
            Ok(())
        }))
    }
}
