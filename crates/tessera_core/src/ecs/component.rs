//! # Component Types
//!
//! Components are identified by a compact numeric [`ComponentTypeId`] that
//! indexes signature bits and archetype columns. The [`ComponentTypes`]
//! registry is an explicit object owned by the caller (no process-wide
//! tables), so tests can build, [`clear`](ComponentTypes::clear) and drop
//! their own.
//!
//! ## Layouts
//!
//! - **Record** components are `Pod`: fixed-size, trivially copyable, stored
//!   in a stride buffer. Only records may live in shared memory and cross
//!   the thread boundary.
//! - **Boxed** components are any `Send + Sync` value, stored one box per row.
//!   They never leave the coordinating thread.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use crate::error::{CoreError, CoreResult};

/// Maximum alignment supported for record components.
///
/// Column buffers are backed by `u64` words.
pub const MAX_RECORD_ALIGN: usize = 8;

/// Registered numeric id of a component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ComponentTypeId(u32);

impl ComponentTypeId {
    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the id as a bit / table index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a component's values are laid out in a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnLayout {
    /// Fixed-size plain-old-data record.
    Record {
        /// Size in bytes (the column stride).
        size: usize,
        /// Alignment in bytes.
        align: usize,
    },
    /// One boxed value per row.
    Boxed,
}

/// Where a record column keeps its bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ColumnStorage {
    /// Owned buffer. Dispatch copies rows into the payload and back.
    #[default]
    Plain,
    /// Shared buffer with write tracking. Dispatch hands out leased views.
    Shared,
}

/// Primitive field type inside a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// `u8`
    U8,
    /// `u16`
    U16,
    /// `u32`
    U32,
    /// `u64`
    U64,
    /// `i32`
    I32,
    /// `i64`
    I64,
    /// `f32`
    F32,
    /// `f64`
    F64,
}

impl FieldKind {
    /// Size of the field in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

/// One named field of a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDesc {
    /// Field name.
    pub name: String,
    /// Primitive type.
    pub kind: FieldKind,
    /// Byte offset inside the record.
    pub offset: usize,
}

/// Field layout of a record component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordSchema {
    fields: Vec<FieldDesc>,
}

impl RecordSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field (builder style).
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind, offset: usize) -> Self {
        self.fields.push(FieldDesc {
            name: name.into(),
            kind,
            offset,
        });
        self
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }
}

/// Metadata for one registered component type.
#[derive(Clone, Debug)]
pub struct ComponentInfo {
    /// Registered id.
    pub id: ComponentTypeId,
    /// Human-readable name.
    pub name: &'static str,
    /// Column layout.
    pub layout: ColumnLayout,
    /// Buffer kind for record columns. Always `Plain` for boxed components.
    pub storage: ColumnStorage,
    /// Optional field schema for record columns.
    pub schema: Option<Arc<RecordSchema>>,
    /// Rust type backing this component.
    type_id: TypeId,
    /// Produces the value a fresh row starts with.
    default_fn: fn() -> Value,
}

impl ComponentInfo {
    /// Record stride, or `None` for boxed components.
    #[must_use]
    pub fn stride(&self) -> Option<usize> {
        match self.layout {
            ColumnLayout::Record { size, .. } => Some(size),
            ColumnLayout::Boxed => None,
        }
    }

    /// Rust type backing this component.
    #[must_use]
    pub fn rust_type(&self) -> TypeId {
        self.type_id
    }

    /// Returns a fresh default value for this component.
    #[must_use]
    pub fn default_value(&self) -> Value {
        (self.default_fn)()
    }
}

fn zeroed_record<T: Pod>() -> Value {
    Value::record(T::zeroed())
}

fn default_boxed<T: Default + Send + Sync + 'static>() -> Value {
    Value::boxed(T::default())
}

/// Registry mapping Rust types to [`ComponentTypeId`]s.
///
/// ## Invariants
/// - ids are dense, assigned in registration order, and stable until `clear`.
/// - every id has exactly one [`ComponentInfo`].
#[derive(Debug, Default)]
pub struct ComponentTypes {
    by_type: HashMap<TypeId, ComponentTypeId>,
    infos: Vec<ComponentInfo>,
    frozen: bool,
}

impl ComponentTypes {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `Pod` record component.
    ///
    /// Registering the same type twice returns the existing id.
    ///
    /// # Errors
    ///
    /// Fails if the registry is frozen, the name belongs to another type,
    /// the type is zero-sized, or its alignment exceeds [`MAX_RECORD_ALIGN`].
    pub fn register_record<T: Pod + Send + Sync>(
        &mut self,
        name: &'static str,
        storage: ColumnStorage,
    ) -> CoreResult<ComponentTypeId> {
        if let Some(&existing) = self.by_type.get(&TypeId::of::<T>()) {
            return Ok(existing);
        }
        let size = std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>();
        if size == 0 {
            return Err(CoreError::ZeroSizedRecord(name));
        }
        if align > MAX_RECORD_ALIGN {
            return Err(CoreError::AlignmentTooLarge {
                name,
                align,
                max: MAX_RECORD_ALIGN,
            });
        }
        self.insert(
            TypeId::of::<T>(),
            name,
            ColumnLayout::Record { size, align },
            storage,
            zeroed_record::<T>,
        )
    }

    /// Registers a boxed component. Fresh rows start at `T::default()`.
    ///
    /// # Errors
    ///
    /// Fails if the registry is frozen or the name belongs to another type.
    pub fn register_boxed<T: Default + Send + Sync + 'static>(
        &mut self,
        name: &'static str,
    ) -> CoreResult<ComponentTypeId> {
        if let Some(&existing) = self.by_type.get(&TypeId::of::<T>()) {
            return Ok(existing);
        }
        self.insert(
            TypeId::of::<T>(),
            name,
            ColumnLayout::Boxed,
            ColumnStorage::Plain,
            default_boxed::<T>,
        )
    }

    fn insert(
        &mut self,
        type_id: TypeId,
        name: &'static str,
        layout: ColumnLayout,
        storage: ColumnStorage,
        default_fn: fn() -> Value,
    ) -> CoreResult<ComponentTypeId> {
        if self.frozen {
            return Err(CoreError::RegistryFrozen(name));
        }
        if self.infos.iter().any(|info| info.name == name) {
            return Err(CoreError::DuplicateName(name));
        }

        #[allow(clippy::cast_possible_truncation)]
        let id = ComponentTypeId::new(self.infos.len() as u32);
        self.by_type.insert(type_id, id);
        self.infos.push(ComponentInfo {
            id,
            name,
            layout,
            storage,
            schema: None,
            type_id,
            default_fn,
        });
        tracing::debug!("registered component {} as {:?} ({:?})", name, id, layout);
        Ok(id)
    }

    /// Attaches a field schema to a record component.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not a record component or a field overflows the record.
    pub fn with_schema(&mut self, id: ComponentTypeId, schema: RecordSchema) -> CoreResult<()> {
        let info = self
            .infos
            .get_mut(id.index())
            .ok_or(CoreError::NotARecord(id))?;
        let ColumnLayout::Record { size, .. } = info.layout else {
            return Err(CoreError::NotARecord(id));
        };
        if let Some(bad) = schema
            .fields()
            .iter()
            .find(|f| f.offset + f.kind.size() > size)
        {
            return Err(CoreError::FieldOutOfRecord {
                field: bad.name.clone(),
                offset: bad.offset,
                size,
            });
        }
        info.schema = Some(Arc::new(schema));
        Ok(())
    }

    /// Returns the id registered for `T`.
    #[must_use]
    pub fn type_id_of<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Returns the metadata for `id`.
    #[must_use]
    pub fn info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// Checks that `id` was registered for the Rust type `T`.
    #[must_use]
    pub fn is_type<T: 'static>(&self, id: ComponentTypeId) -> bool {
        self.info(id).is_some_and(|info| info.type_id == TypeId::of::<T>())
    }

    /// Default value for a fresh row of `id`.
    #[must_use]
    pub fn default_value(&self, id: ComponentTypeId) -> Option<Value> {
        self.info(id).map(ComponentInfo::default_value)
    }

    /// Number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Checks if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Prevents further registrations.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Checks whether the registry is frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Forgets every registration and unfreezes.
    pub fn clear(&mut self) {
        self.by_type.clear();
        self.infos.clear();
        self.frozen = false;
    }
}

/// An owned component value.
pub enum Value {
    /// Raw bytes of a record.
    Record(Vec<u8>),
    /// A boxed value.
    Boxed(Box<dyn Any + Send + Sync>),
}

impl Value {
    /// Wraps a record.
    #[must_use]
    pub fn record<T: Pod>(value: T) -> Self {
        Self::Record(bytemuck::bytes_of(&value).to_vec())
    }

    /// Wraps a boxed value.
    #[must_use]
    pub fn boxed<T: Any + Send + Sync>(value: T) -> Self {
        Self::Boxed(Box::new(value))
    }

    /// Reads the record as `T`. `None` if boxed or the size differs.
    #[must_use]
    pub fn read<T: Pod>(&self) -> Option<T> {
        self.view().read()
    }

    /// Unwraps a boxed value of type `T`.
    #[must_use]
    pub fn downcast<T: Any>(self) -> Option<T> {
        match self {
            Self::Boxed(b) => {
                let any: Box<dyn Any> = b;
                any.downcast::<T>().ok().map(|b| *b)
            }
            Self::Record(_) => None,
        }
    }

    /// Borrows the value.
    #[must_use]
    pub fn view(&self) -> ValueRef<'_> {
        match self {
            Self::Record(bytes) => ValueRef::Record(bytes),
            Self::Boxed(b) => ValueRef::Boxed(b.as_ref()),
        }
    }

    /// Checks if this is a record value.
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Self::Record(_))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(bytes) => f.debug_tuple("Record").field(&bytes.len()).finish(),
            Self::Boxed(_) => f.write_str("Boxed(..)"),
        }
    }
}

/// A borrowed component value.
#[derive(Clone, Copy)]
pub enum ValueRef<'a> {
    /// Raw bytes of a record.
    Record(&'a [u8]),
    /// A boxed value.
    Boxed(&'a (dyn Any + Send + Sync)),
}

impl<'a> ValueRef<'a> {
    /// Reads the record as `T`. `None` if boxed or the size differs.
    #[must_use]
    pub fn read<T: Pod>(self) -> Option<T> {
        match self {
            Self::Record(bytes) if bytes.len() == std::mem::size_of::<T>() => {
                Some(bytemuck::pod_read_unaligned(bytes))
            }
            _ => None,
        }
    }

    /// Borrows a boxed value as `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(self) -> Option<&'a T> {
        match self {
            Self::Boxed(b) => b.downcast_ref::<T>(),
            Self::Record(_) => None,
        }
    }
}

impl fmt::Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(bytes) => f.debug_tuple("Record").field(&bytes.len()).finish(),
            Self::Boxed(_) => f.write_str("Boxed(..)"),
        }
    }
}
