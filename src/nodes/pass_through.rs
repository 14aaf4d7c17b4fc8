//! Pass-through nodes.
//!
//! Useful as graph boundaries: a composite node can forward a port to one of
//! these and expose a stable endpoint regardless of what sits behind it.

use crate::error::GraphResult;
use crate::graph::{
    Buffer, BufferElement, Capability, DataInput, DataOutput, Kernel, MessageContext,
    MessageInput, MessageOutput, NodeDefinition, NodeDescription, PortData, RenderContext,
};
use std::any::Any;
use std::marker::PhantomData;

/// Re-emits every message it receives.
pub struct Relay<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M: Clone + 'static> Relay<M> {
    pub const INPUT: MessageInput<M> = MessageInput::new(0);
    pub const OUTPUT: MessageOutput<M> = MessageOutput::new(0);
}

impl<M> Default for Relay<M> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M: Clone + 'static> NodeDefinition for Relay<M> {
    fn describe(desc: &mut NodeDescription) {
        desc.message_input(Self::INPUT, "input")
            .message_output(Self::OUTPUT, "output")
            .capability(Capability::MessageHandler);
    }

    fn handle_message(&mut self, ctx: &mut MessageContext<'_>, message: &dyn Any) -> GraphResult<()> {
        match message.downcast_ref::<M>() {
            Some(message) => ctx.emit(Self::OUTPUT, message.clone()),
            None => Ok(()),
        }
    }
}

/// Copies a plain data input to its output every cycle.
///
/// Use [`BufferPassThrough`] for buffers. Output buffers always describe
/// this node's own storage, so a buffer copied through here reads as empty.
pub struct PassThrough<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: PortData> PassThrough<T> {
    pub const INPUT: DataInput<T> = DataInput::new(0);
    pub const OUTPUT: DataOutput<T> = DataOutput::new(0);
}

impl<T> Default for PassThrough<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: PortData> NodeDefinition for PassThrough<T> {
    fn describe(desc: &mut NodeDescription) {
        desc.data_input(Self::INPUT, "input")
            .data_output(Self::OUTPUT, "output")
            .capability(Capability::Kernel);
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let value = ctx.input(Self::INPUT)?.clone();
            *ctx.output(Self::OUTPUT)? = value;
            Ok(())
        }))
    }
}

/// Copies buffer contents into its own output buffer.
///
/// The output is sized through [`BufferPassThrough::SIZE`]. When input and
/// output lengths differ the common prefix is copied and the rest of the
/// output keeps its previous contents.
pub struct BufferPassThrough<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E: BufferElement> BufferPassThrough<E> {
    pub const INPUT: DataInput<Buffer<E>> = DataInput::new(0);
    pub const SIZE: MessageInput<usize> = MessageInput::new(1);
    pub const OUTPUT: DataOutput<Buffer<E>> = DataOutput::new(0);
}

impl<E> Default for BufferPassThrough<E> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E: BufferElement> NodeDefinition for BufferPassThrough<E> {
    fn describe(desc: &mut NodeDescription) {
        desc.data_input(Self::INPUT, "input")
            .message_input(Self::SIZE, "size")
            .data_output(Self::OUTPUT, "output")
            .capability(Capability::Kernel)
            .capability(Capability::MessageHandler);
    }

    fn handle_message(&mut self, ctx: &mut MessageContext<'_>, message: &dyn Any) -> GraphResult<()> {
        match message.downcast_ref::<usize>() {
            Some(&size) => ctx.set_buffer_size(Self::OUTPUT, size),
            None => Ok(()),
        }
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let (inputs, outputs) = ctx.io();
            let source = inputs.buffer(Self::INPUT)?;
            let target = outputs.buffer_mut(Self::OUTPUT)?;
            let shared = source.len().min(target.len());
            target[..shared].clone_from_slice(&source[..shared]);
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeSet, RenderExecutionModel};

    #[test]
    fn test_relay_chain() {
        let mut set = NodeSet::new();
        let a = set.create::<Relay<u8>>().unwrap();
        let b = set.create::<Relay<u8>>().unwrap();
        set.connect(a, Relay::<u8>::OUTPUT, b, Relay::<u8>::INPUT).unwrap();
        set.send_message(a, Relay::<u8>::INPUT, 4).unwrap();
        assert!(set
            .send_message(b, MessageInput::<u16>::new(0), 4)
            .is_err());
    }

    #[test]
    fn test_pass_through_copies_value() {
        let mut set = NodeSet::new();
        set.set_execution_model(RenderExecutionModel::Synchronous);
        let node = set.create::<PassThrough<f64>>().unwrap();
        set.set_data(node, PassThrough::<f64>::INPUT, 2.5).unwrap();
        let value = set.request_readback(node, PassThrough::<f64>::OUTPUT).unwrap();
        set.update().unwrap();
        assert_eq!(set.read_value(&value).unwrap(), 2.5);
    }

    #[test]
    fn test_buffer_pass_through_copies_prefix() {
        let mut set = NodeSet::new();
        let first = set.create::<BufferPassThrough<u16>>().unwrap();
        let second = set.create::<BufferPassThrough<u16>>().unwrap();
        set.connect(
            first,
            BufferPassThrough::<u16>::OUTPUT,
            second,
            BufferPassThrough::<u16>::INPUT,
        )
        .unwrap();
        set.send_message(first, BufferPassThrough::<u16>::SIZE, 2).unwrap();
        set.send_message(second, BufferPassThrough::<u16>::SIZE, 3).unwrap();
        let value = set
            .request_readback(second, BufferPassThrough::<u16>::OUTPUT)
            .unwrap();
        set.update().unwrap();
        assert_eq!(set.read_buffer(&value).unwrap(), vec![0, 0, 0]);
    }
}
