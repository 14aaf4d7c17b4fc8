//! Kernels and the context they execute in.
//!
//! A kernel is the render-side half of a node. Each cycle the scheduler runs
//! it once with a [`RenderContext`] exposing the node's data inputs (read
//! only, aliased from producers) and data outputs (exclusive). Errors and
//! panics raised by a kernel become [`GraphError::KernelFault`] and tear
//! the render world down.

use super::buffer::{Buffer, BufferElement};
use super::cell::{InputBinding, PortCell, SharedCell, SlotGuard};
use super::data::{PortData, ValueType};
use super::id::{InputPortId, NodeHandle, OutputPortId};
use super::port::{DataInput, DataInputArray, DataOutput};
use crate::error::{GraphError, GraphResult};
use parking_lot::RwLockWriteGuard;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

/// Render-side computation of a node.
pub trait Kernel: Send + 'static {
    /// Run one cycle.
    fn execute(&mut self, ctx: &mut RenderContext<'_>) -> anyhow::Result<()>;

    /// Receive a value queued by the simulation side with `update_kernel_data`.
    fn apply_data(&mut self, data: Box<dyn Any + Send>) -> anyhow::Result<()> {
        drop(data);
        tracing::warn!("Kernel received data but does not override apply_data");
        Ok(())
    }
}

impl<F> Kernel for F
where
    F: FnMut(&mut RenderContext<'_>) -> anyhow::Result<()> + Send + 'static,
{
    fn execute(&mut self, ctx: &mut RenderContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

pub(crate) enum InputSlots {
    Scalar(InputBinding),
    Array(Vec<InputBinding>),
}

pub(crate) struct RenderInput {
    pub(crate) value_type: ValueType,
    pub(crate) slots: InputSlots,
}

impl RenderInput {
    pub(crate) fn slot(&self, index: Option<u16>) -> Option<&InputBinding> {
        match (&self.slots, index) {
            (InputSlots::Scalar(binding), None) => Some(binding),
            (InputSlots::Array(bindings), Some(i)) => bindings.get(i as usize),
            _ => None,
        }
    }

    pub(crate) fn slot_mut(&mut self, index: Option<u16>) -> Option<&mut InputBinding> {
        match (&mut self.slots, index) {
            (InputSlots::Scalar(binding), None) => Some(binding),
            (InputSlots::Array(bindings), Some(i)) => bindings.get_mut(i as usize),
            _ => None,
        }
    }

    fn read(&self) -> InputGuard<'_> {
        let slots = match &self.slots {
            InputSlots::Scalar(binding) => PortGuard::Scalar(binding.read()),
            InputSlots::Array(bindings) => {
                PortGuard::Array(bindings.iter().map(InputBinding::read).collect())
            }
        };
        InputGuard {
            value_type: self.value_type,
            slots,
        }
    }
}

pub(crate) struct RenderOutput {
    pub(crate) value_type: ValueType,
    pub(crate) cell: SharedCell,
}

/// Render-side node: the kernel plus its port bindings.
pub(crate) struct KernelNode {
    pub(crate) handle: NodeHandle,
    pub(crate) name: &'static str,
    pub(crate) kernel: Box<dyn Kernel>,
    pub(crate) inputs: Vec<Option<RenderInput>>,
    pub(crate) outputs: Vec<Option<RenderOutput>>,
}

impl KernelNode {
    pub(crate) fn execute(&mut self, cycle: u64) -> GraphResult<()> {
        let KernelNode {
            handle,
            name,
            kernel,
            inputs,
            outputs,
        } = self;
        let handle = *handle;

        let inputs = InputView {
            handle,
            ports: inputs.iter().map(|p| p.as_ref().map(RenderInput::read)).collect(),
        };
        let outputs = OutputView {
            handle,
            ports: outputs
                .iter()
                .map(|o| {
                    o.as_ref().map(|o| OutputGuard {
                        value_type: o.value_type,
                        cell: o.cell.write(),
                    })
                })
                .collect(),
        };
        let mut ctx = RenderContext {
            handle,
            cycle,
            inputs,
            outputs,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| kernel.execute(&mut ctx)));
        ctx.outputs.restamp();

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(GraphError::KernelFault { node: handle, source }),
            Err(payload) => Err(GraphError::KernelFault {
                node: handle,
                source: anyhow::anyhow!("{} panicked: {}", name, panic_message(payload.as_ref())),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

enum PortGuard<'a> {
    Scalar(SlotGuard<'a>),
    Array(Vec<SlotGuard<'a>>),
}

struct InputGuard<'a> {
    value_type: ValueType,
    slots: PortGuard<'a>,
}

struct OutputGuard<'a> {
    value_type: ValueType,
    cell: RwLockWriteGuard<'a, PortCell>,
}

/// Everything a kernel can touch during one run.
pub struct RenderContext<'a> {
    handle: NodeHandle,
    cycle: u64,
    inputs: InputView<'a>,
    outputs: OutputView<'a>,
}

impl<'a> RenderContext<'a> {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// Index of the cycle being executed.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn input<T: PortData>(&self, port: DataInput<T>) -> GraphResult<&T> {
        self.inputs.get(port)
    }

    pub fn input_array<T: PortData>(&self, port: DataInputArray<T>) -> GraphResult<InputArray<'_, T>> {
        self.inputs.array(port)
    }

    pub fn input_buffer<E: BufferElement>(&self, port: DataInput<Buffer<E>>) -> GraphResult<&[E]> {
        self.inputs.buffer(port)
    }

    /// Elements of a buffer found in any input value, including nested fields.
    pub fn resolve<E: BufferElement>(&self, buffer: &Buffer<E>) -> GraphResult<&[E]> {
        self.inputs.resolve(buffer)
    }

    pub fn output<T: PortData>(&mut self, port: DataOutput<T>) -> GraphResult<&mut T> {
        self.outputs.get_mut(port)
    }

    pub fn output_buffer<E: BufferElement>(
        &mut self,
        port: DataOutput<Buffer<E>>,
    ) -> GraphResult<&mut [E]> {
        self.outputs.buffer_mut(port)
    }

    pub fn output_sub_buffer<T: PortData, E: BufferElement>(
        &mut self,
        port: DataOutput<T>,
        field: usize,
    ) -> GraphResult<&mut [E]> {
        self.outputs.sub_buffer_mut(port, field)
    }

    /// Split borrow for kernels reading inputs while writing outputs.
    pub fn io(&mut self) -> (&InputView<'a>, &mut OutputView<'a>) {
        (&self.inputs, &mut self.outputs)
    }
}

/// Read-only view of a kernel's data inputs.
pub struct InputView<'a> {
    handle: NodeHandle,
    ports: Vec<Option<InputGuard<'a>>>,
}

impl<'a> InputView<'a> {
    fn port(&self, port: InputPortId) -> GraphResult<&InputGuard<'a>> {
        self.ports
            .get(port.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                GraphError::invalid(format!("{:?} is not a data input of {}", port, self.handle))
            })
    }

    fn typed<T: PortData>(&self, port: InputPortId) -> GraphResult<&InputGuard<'a>> {
        let guard = self.port(port)?;
        if !guard.value_type.tag().is::<T>() {
            return Err(GraphError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found: guard.value_type.name(),
            });
        }
        Ok(guard)
    }

    pub fn get<T: PortData>(&self, port: DataInput<T>) -> GraphResult<&T> {
        match &self.typed::<T>(port.port())?.slots {
            PortGuard::Scalar(slot) => downcast::<T>(slot),
            PortGuard::Array(_) => Err(GraphError::invalid(format!(
                "{:?} is a port array; read it with input_array",
                port.port()
            ))),
        }
    }

    pub fn array<T: PortData>(&self, port: DataInputArray<T>) -> GraphResult<InputArray<'_, T>> {
        match &self.typed::<T>(port.port())?.slots {
            PortGuard::Array(slots) => Ok(InputArray {
                slots,
                _marker: PhantomData,
            }),
            PortGuard::Scalar(_) => Err(GraphError::invalid(format!(
                "{:?} is not a port array",
                port.port()
            ))),
        }
    }

    pub fn buffer<E: BufferElement>(&self, port: DataInput<Buffer<E>>) -> GraphResult<&[E]> {
        let buffer = self.get(port)?;
        self.resolve(buffer)
    }

    pub fn resolve<E: BufferElement>(&self, buffer: &Buffer<E>) -> GraphResult<&[E]> {
        let Some(id) = buffer.allocation() else {
            return Ok(&[]);
        };
        let found = self.ports.iter().flatten().find_map(|guard| match &guard.slots {
            PortGuard::Scalar(slot) => slot.find_allocation(id),
            PortGuard::Array(slots) => slots.iter().find_map(|slot| slot.find_allocation(id)),
        });
        let allocation = found.ok_or_else(|| {
            GraphError::invalid(format!(
                "buffer {:?} owned by {} is not reachable from the inputs of {}",
                id,
                buffer.owner(),
                self.handle
            ))
        })?;
        allocation.slice::<E>().ok_or(GraphError::TypeMismatch {
            expected: std::any::type_name::<E>(),
            found: "buffer of another element type",
        })
    }
}

fn downcast<'s, T: PortData>(slot: &'s SlotGuard<'_>) -> GraphResult<&'s T> {
    slot.value
        .as_any()
        .downcast_ref::<T>()
        .ok_or(GraphError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found: "value of another type",
        })
}

/// The slots of a data input array.
pub struct InputArray<'v, T> {
    slots: &'v [SlotGuard<'v>],
    _marker: PhantomData<fn() -> T>,
}

impl<'v, T: PortData> InputArray<'v, T> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> GraphResult<&'v T> {
        let slot = self.slots.get(index).ok_or_else(|| GraphError::IndexOutOfRange {
            what: "input array".to_string(),
            index,
            size: self.slots.len(),
        })?;
        downcast::<T>(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'v T> + 'v {
        self.slots
            .iter()
            .filter_map(|slot| slot.value.as_any().downcast_ref::<T>())
    }
}

/// Exclusive view of a kernel's data outputs.
pub struct OutputView<'a> {
    handle: NodeHandle,
    ports: Vec<Option<OutputGuard<'a>>>,
}

impl<'a> OutputView<'a> {
    fn port_mut(&mut self, port: OutputPortId) -> GraphResult<&mut OutputGuard<'a>> {
        let handle = self.handle;
        self.ports
            .get_mut(port.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                GraphError::invalid(format!("{:?} is not a data output of {}", port, handle))
            })
    }

    fn typed_mut<T: PortData>(&mut self, port: OutputPortId) -> GraphResult<&mut PortCell> {
        let guard = self.port_mut(port)?;
        if !guard.value_type.tag().is::<T>() {
            return Err(GraphError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found: guard.value_type.name(),
            });
        }
        Ok(&mut *guard.cell)
    }

    pub fn get_mut<T: PortData>(&mut self, port: DataOutput<T>) -> GraphResult<&mut T> {
        self.typed_mut::<T>(port.port())?
            .value
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or(GraphError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found: "value of another type",
            })
    }

    pub fn buffer_mut<E: BufferElement>(&mut self, port: DataOutput<Buffer<E>>) -> GraphResult<&mut [E]> {
        self.sub_buffer_mut(port, 0)
    }

    pub fn sub_buffer_mut<T: PortData, E: BufferElement>(
        &mut self,
        port: DataOutput<T>,
        field: usize,
    ) -> GraphResult<&mut [E]> {
        let cell = self.typed_mut::<T>(port.port())?;
        let fields = cell.buffers.len();
        match cell.buffers.get_mut(field) {
            None => Err(GraphError::IndexOutOfRange {
                what: format!("buffer fields of {}", std::any::type_name::<T>()),
                index: field,
                size: fields,
            }),
            Some(None) => Ok(&mut []),
            Some(Some(allocation)) => allocation.slice_mut::<E>().ok_or(GraphError::TypeMismatch {
                expected: std::any::type_name::<E>(),
                found: "buffer of another element type",
            }),
        }
    }

    fn restamp(&mut self) {
        for guard in self.ports.iter_mut().flatten() {
            guard.cell.restamp();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::buffer::{AllocatedBuffer, ElementType};
    use parking_lot::RwLock;
    use std::sync::Arc;

    const IN: DataInput<f32> = DataInput::new(0);
    const OUT: DataOutput<Buffer<f32>> = DataOutput::new(0);

    fn node_with(kernel: impl Kernel) -> (KernelNode, SharedCell) {
        let handle = NodeHandle::new(0, 1);
        let out_type = ValueType::of::<Buffer<f32>>();
        let mut cell = PortCell::new(&out_type, handle);
        cell.buffers[0] = AllocatedBuffer::allocate(ElementType::of::<f32>(), 3);
        cell.restamp();
        let cell = Arc::new(RwLock::new(cell));
        let input = RenderInput {
            value_type: ValueType::of::<f32>(),
            slots: InputSlots::Scalar(InputBinding::Owned(Arc::new(PortCell::owned(Box::new(2.0f32))))),
        };
        let node = KernelNode {
            handle,
            name: "test",
            kernel: Box::new(kernel),
            inputs: vec![Some(input)],
            outputs: vec![Some(RenderOutput {
                value_type: out_type,
                cell: cell.clone(),
            })],
        };
        (node, cell)
    }

    #[test]
    fn test_kernel_reads_input_and_fills_buffer() {
        let (mut node, cell) = node_with(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            let scale = *ctx.input(IN)?;
            for (i, v) in ctx.output_buffer(OUT)?.iter_mut().enumerate() {
                *v = i as f32 * scale;
            }
            Ok(())
        });
        node.execute(0).unwrap();
        let cell = cell.read();
        assert_eq!(cell.buffers[0].as_ref().unwrap().slice::<f32>().unwrap(), &[0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let (mut node, _) = node_with(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            ctx.input(DataInput::<i32>::new(0))?;
            Ok(())
        });
        let err = node.execute(0).unwrap_err();
        assert!(matches!(err, GraphError::KernelFault { .. }));
        assert!(err.to_string().contains("Type mismatch"));
    }

    #[test]
    fn test_panic_becomes_fault() {
        let (mut node, _) = node_with(|_: &mut RenderContext<'_>| -> anyhow::Result<()> {
            panic!("boom");
        });
        let err = node.execute(0).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_descriptor_tampering_is_undone() {
        let (mut node, cell) = node_with(|ctx: &mut RenderContext<'_>| -> anyhow::Result<()> {
            *ctx.output(OUT)? = Buffer::default();
            Ok(())
        });
        node.execute(0).unwrap();
        let cell = cell.read();
        let value = cell.value.as_any().downcast_ref::<Buffer<f32>>().unwrap();
        assert_eq!(value.len(), 3);
        assert_eq!(value.owner(), NodeHandle::new(0, 1));
    }
}
