//! Values carried by data ports.
//!
//! Every data port payload implements [`PortData`]. Aggregate payloads with
//! nested [`Buffer`](super::buffer::Buffer) fields enumerate those fields
//! through `buffer_field`/`buffer_field_mut`, which lets the render graph
//! allocate, re-stamp and resolve them without knowing the concrete type.
//! The [`impl_port_data!`](crate::impl_port_data) macro writes these
//! accessors for plain structs.

use super::buffer::BufferDescription;
use std::any::{Any, TypeId};
use std::fmt;

/// A value that can travel through a data port.
pub trait PortData: Clone + Default + Send + Sync + 'static {
    /// Number of nested buffer fields, addressed `0..BUFFER_FIELDS`.
    const BUFFER_FIELDS: usize = 0;

    fn buffer_field(&self, _field: usize) -> Option<&BufferDescription> {
        None
    }

    fn buffer_field_mut(&mut self, _field: usize) -> Option<&mut BufferDescription> {
        None
    }
}

macro_rules! impl_port_data_for_primitives {
    ($($ty:ty),* $(,)?) => {
        $(impl PortData for $ty {})*
    };
}

impl_port_data_for_primitives!(
    (),
    bool,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    char
);

impl<T, const N: usize> PortData for [T; N]
where
    T: Copy + Send + Sync + 'static,
    [T; N]: Default,
{
}

/// Implements [`PortData`] for a struct, listing its buffer fields in order.
///
/// ```ignore
/// #[derive(Clone, Default)]
/// struct Samples { gain: f32, left: Buffer<f32>, right: Buffer<f32> }
/// impl_port_data!(Samples { left, right });
/// ```
#[macro_export]
macro_rules! impl_port_data {
    ($ty:ty) => {
        impl $crate::graph::PortData for $ty {}
    };
    ($ty:ty { $($field:ident),+ $(,)? }) => {
        impl $crate::graph::PortData for $ty {
            const BUFFER_FIELDS: usize = [$(stringify!($field)),+].len();

            fn buffer_field(&self, field: usize) -> Option<&$crate::graph::BufferDescription> {
                let fields = [$(self.$field.description()),+];
                fields.get(field).copied()
            }

            #[allow(unused_assignments)]
            fn buffer_field_mut(
                &mut self,
                field: usize,
            ) -> Option<&mut $crate::graph::BufferDescription> {
                let mut index = 0usize;
                $(
                    if index == field {
                        return Some(self.$field.description_mut());
                    }
                    index += 1;
                )+
                None
            }
        }
    };
}

/// Identity of a message, data or domain payload type.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> TypeId {
        self.id
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Object-safe view of a [`PortData`] value.
pub(crate) trait DataValue: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_value(&self) -> Box<dyn DataValue>;
    fn buffer_field(&self, field: usize) -> Option<&BufferDescription>;
    fn buffer_field_mut(&mut self, field: usize) -> Option<&mut BufferDescription>;
}

impl<T: PortData> DataValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_value(&self) -> Box<dyn DataValue> {
        Box::new(self.clone())
    }

    fn buffer_field(&self, field: usize) -> Option<&BufferDescription> {
        PortData::buffer_field(self, field)
    }

    fn buffer_field_mut(&mut self, field: usize) -> Option<&mut BufferDescription> {
        PortData::buffer_field_mut(self, field)
    }
}

/// Runtime description of a data port's value type.
#[derive(Clone, Copy)]
pub struct ValueType {
    tag: TypeTag,
    buffer_fields: usize,
    make_default: fn() -> Box<dyn DataValue>,
    from_any: fn(&dyn Any) -> Option<Box<dyn DataValue>>,
}

impl ValueType {
    pub fn of<T: PortData>() -> Self {
        Self {
            tag: TypeTag::of::<T>(),
            buffer_fields: T::BUFFER_FIELDS,
            make_default: || Box::new(T::default()),
            from_any: |any| {
                any.downcast_ref::<T>()
                    .map(|value| Box::new(value.clone()) as Box<dyn DataValue>)
            },
        }
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn name(&self) -> &'static str {
        self.tag.name()
    }

    pub fn buffer_fields(&self) -> usize {
        self.buffer_fields
    }

    pub fn has_buffers(&self) -> bool {
        self.buffer_fields > 0
    }

    pub(crate) fn make_default(&self) -> Box<dyn DataValue> {
        (self.make_default)()
    }

    /// Clones a message payload into an owned data value of this type.
    pub(crate) fn value_from_any(&self, any: &dyn Any) -> Option<Box<dyn DataValue>> {
        (self.from_any)(any)
    }
}

impl PartialEq for ValueType {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueType")
            .field("name", &self.tag.name)
            .field("buffer_fields", &self.buffer_fields)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::buffer::Buffer;

    #[derive(Clone, Default)]
    struct Aggregate {
        gain: f32,
        left: Buffer<f32>,
        right: Buffer<u16>,
    }

    crate::impl_port_data!(Aggregate { left, right });

    #[test]
    fn test_primitive_has_no_buffers() {
        let ty = ValueType::of::<f32>();
        assert!(!ty.has_buffers());
        assert!(ty.tag().is::<f32>());
    }

    #[test]
    fn test_aggregate_buffer_fields() {
        let mut value = Aggregate::default();
        assert_eq!(Aggregate::BUFFER_FIELDS, 2);
        assert!(PortData::buffer_field(&value, 0).unwrap().element().is::<f32>());
        assert!(PortData::buffer_field(&value, 1).unwrap().element().is::<u16>());
        assert!(PortData::buffer_field(&value, 2).is_none());
        assert!(PortData::buffer_field_mut(&mut value, 1).is_some());
        value.gain = 2.0;
        assert_eq!(value.gain, 2.0);
    }

    #[test]
    fn test_value_from_any_checks_type() {
        let ty = ValueType::of::<i32>();
        let boxed = ty.value_from_any(&7i32).unwrap();
        assert_eq!(boxed.as_any().downcast_ref::<i32>(), Some(&7));
        assert!(ty.value_from_any(&7u8).is_none());
    }

    #[test]
    fn test_default_value() {
        let ty = ValueType::of::<[f32; 3]>();
        let value = ty.make_default();
        assert_eq!(value.as_any().downcast_ref::<[f32; 3]>(), Some(&[0.0; 3]));
    }
}
