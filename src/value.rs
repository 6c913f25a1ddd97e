use std::{fmt, ptr::NonNull};

/// Address of one cell inside a marked block.
///
/// Cell identity is address identity; the collector never looks at the
/// bytes behind a cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CellPtr(NonNull<u8>);

impl CellPtr {
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// # Safety
    ///
    /// `ptr` must be non-null.
    pub const unsafe fn new_unchecked(ptr: *mut u8) -> Self {
        Self(NonNull::new_unchecked(ptr))
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell({:p})", self.0)
    }
}

/// Value stored in handles and weak slots.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Value {
    /// No value at all. Handles start out empty.
    Empty,
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    Cell(CellPtr),
}

impl Default for Value {
    fn default() -> Self {
        Value::Empty
    }
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn is_cell(&self) -> bool {
        matches!(self, Value::Cell(_))
    }

    pub fn as_cell(&self) -> Option<CellPtr> {
        match *self {
            Value::Cell(cell) => Some(cell),
            _ => None,
        }
    }
}

impl From<CellPtr> for Value {
    fn from(cell: CellPtr) -> Self {
        Value::Cell(cell)
    }
}
