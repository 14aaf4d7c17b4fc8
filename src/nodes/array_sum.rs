//! Sums every slot of a data input array.

use crate::error::GraphResult;
use crate::graph::{
    Capability, DataInputArray, DataOutput, Kernel, MessageContext, MessageInput, NodeDefinition,
    NodeDescription, RenderContext,
};
use std::any::Any;

/// Adds up all connected or assigned slots of [`ArraySum::INPUTS`].
///
/// The array starts empty; send the desired slot count to
/// [`ArraySum::COUNT`] before connecting producers.
#[derive(Default)]
pub struct ArraySum {
    slots: u16,
}

impl ArraySum {
    pub const INPUTS: DataInputArray<f32> = DataInputArray::new(0);
    pub const COUNT: MessageInput<u16> = MessageInput::new(1);
    pub const SUM: DataOutput<f32> = DataOutput::new(0);

    pub fn slots(&self) -> u16 {
        self.slots
    }
}

impl NodeDefinition for ArraySum {
    fn describe(desc: &mut NodeDescription) {
        desc.data_input_array(ArraySum::INPUTS, "inputs")
            .message_input(ArraySum::COUNT, "count")
            .data_output(ArraySum::SUM, "sum")
            .capability(Capability::Kernel)
            .capability(Capability::MessageHandler);
    }

    fn handle_message(&mut self, ctx: &mut MessageContext<'_>, message: &dyn Any) -> GraphResult<()> {
        if let Some(&count) = message.downcast_ref::<u16>() {
            ctx.set_port_array_size(ArraySum::INPUTS, count)?;
            self.slots = count;
        }
        Ok(())
    }

    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        Some(Box::new(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let sum = ctx.input_array(ArraySum::INPUTS)?.iter().sum::<f32>();
            *ctx.output(ArraySum::SUM)? = sum;
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeSet;

    #[test]
    fn test_sum_of_assigned_slots() {
        let mut set = NodeSet::new();
        let node = set.create::<ArraySum>().unwrap();
        set.send_message(node, ArraySum::COUNT, 3).unwrap();
        assert_eq!(set.node_data::<ArraySum>(node).unwrap().slots(), 3);
        set.set_data_indexed(node, ArraySum::INPUTS, 0, 1.5).unwrap();
        set.set_data_indexed(node, ArraySum::INPUTS, 2, 2.0).unwrap();
        assert!(set.set_data_indexed(node, ArraySum::INPUTS, 3, 9.0).is_err());

        let sum = set.request_readback(node, ArraySum::SUM).unwrap();
        set.update().unwrap();
        assert_eq!(set.read_value(&sum).unwrap(), 3.5);
    }
}
