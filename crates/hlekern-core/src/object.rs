//! ID-keyed table of live kernel objects
//!
//! Every primitive is created, looked up and destroyed through the
//! [`ObjectTable`] by a 32-bit ID. An ID is the object kind's base in the
//! high byte plus a per-kind serial; serials only grow, so an ID that has
//! been removed is never handed out again.

use crate::error::{KernelError, KernelResult};
use crate::sync::{Cond, EventFlag, EventPort, EventQueue, LwCond, LwMutex, Mutex, RwLock, Semaphore};
use rustc_hash::FxHashMap;

/// Largest per-kind serial that fits below the kind byte
const MAX_SERIAL: u32 = 0x00FF_FFFF;

/// Kind of a kernel object
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// Mutex
    Mutex,
    /// Condition variable
    Cond,
    /// Reader/writer lock
    RwLock,
    /// Counting semaphore
    Semaphore,
    /// Event flag
    EventFlag,
    /// Event queue
    EventQueue,
    /// Event port
    EventPort,
    /// Kernel side of a lightweight mutex
    LwMutex,
    /// Kernel side of a lightweight condition variable
    LwCond,
}

impl ObjectType {
    /// High-byte tag of IDs of this kind
    pub fn id_base(self) -> u32 {
        match self {
            ObjectType::Mutex => 0x8500_0000,
            ObjectType::Cond => 0x8600_0000,
            ObjectType::RwLock => 0x8800_0000,
            ObjectType::EventQueue => 0x8D00_0000,
            ObjectType::EventPort => 0x0E00_0000,
            ObjectType::LwMutex => 0x9500_0000,
            ObjectType::Semaphore => 0x9600_0000,
            ObjectType::LwCond => 0x9700_0000,
            ObjectType::EventFlag => 0x9800_0000,
        }
    }
}

macro_rules! object_kinds {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        /// A live kernel object
        pub enum KernelObject {
            $(
                #[allow(missing_docs)]
                $variant($ty),
            )*
        }

        impl KernelObject {
            /// Kind of this object
            pub fn object_type(&self) -> ObjectType {
                match self {
                    $(KernelObject::$variant(_) => ObjectType::$variant,)*
                }
            }
        }

        $(
            impl ObjectKind for $ty {
                const TYPE: ObjectType = ObjectType::$variant;

                fn into_object(self) -> KernelObject {
                    KernelObject::$variant(self)
                }

                fn from_object(object: &KernelObject) -> Option<&Self> {
                    match object {
                        KernelObject::$variant(value) => Some(value),
                        _ => None,
                    }
                }

                fn from_object_mut(object: &mut KernelObject) -> Option<&mut Self> {
                    match object {
                        KernelObject::$variant(value) => Some(value),
                        _ => None,
                    }
                }

                fn from_owned(object: KernelObject) -> Result<Self, KernelObject> {
                    match object {
                        KernelObject::$variant(value) => Ok(value),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

/// A type that can be stored in the object table
pub trait ObjectKind: Sized {
    /// Kind tag of this type
    const TYPE: ObjectType;

    /// Wrap into a table entry
    fn into_object(self) -> KernelObject;

    /// Borrow out of a table entry of the right kind
    fn from_object(object: &KernelObject) -> Option<&Self>;

    /// Mutably borrow out of a table entry of the right kind
    fn from_object_mut(object: &mut KernelObject) -> Option<&mut Self>;

    /// Unwrap an owned entry, handing it back if the kind differs
    fn from_owned(object: KernelObject) -> Result<Self, KernelObject>;
}

object_kinds! {
    Mutex => Mutex,
    Cond => Cond,
    RwLock => RwLock,
    Semaphore => Semaphore,
    EventFlag => EventFlag,
    EventQueue => EventQueue,
    EventPort => EventPort,
    LwMutex => LwMutex,
    LwCond => LwCond,
}

/// Registry of live kernel objects, keyed by ID
pub struct ObjectTable {
    objects: FxHashMap<u32, KernelObject>,
    serials: FxHashMap<ObjectType, u32>,
    limit: Option<usize>,
}

impl ObjectTable {
    /// Create an empty table holding at most `limit` objects
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            objects: FxHashMap::default(),
            serials: FxHashMap::default(),
            limit,
        }
    }

    /// Insert a new object and return its ID
    pub fn create<T: ObjectKind>(&mut self, value: T) -> KernelResult<u32> {
        self.create_with(|_| value)
    }

    /// Insert a new object built from its freshly assigned ID
    pub fn create_with<T: ObjectKind>(&mut self, build: impl FnOnce(u32) -> T) -> KernelResult<u32> {
        if let Some(limit) = self.limit {
            if self.objects.len() >= limit {
                return Err(KernelError::TableFull);
            }
        }

        let serial = self.serials.entry(T::TYPE).or_insert(0);
        if *serial >= MAX_SERIAL {
            return Err(KernelError::TableFull);
        }
        *serial += 1;

        let id = T::TYPE.id_base() | *serial;
        self.objects.insert(id, build(id).into_object());
        log::debug!("created {:?} {:#010x}", T::TYPE, id);
        Ok(id)
    }

    /// Borrow an object of kind `T`
    pub fn get<T: ObjectKind>(&self, id: u32) -> KernelResult<&T> {
        self.objects
            .get(&id)
            .and_then(T::from_object)
            .ok_or(KernelError::NotFound)
    }

    /// Mutably borrow an object of kind `T`
    pub fn get_mut<T: ObjectKind>(&mut self, id: u32) -> KernelResult<&mut T> {
        self.objects
            .get_mut(&id)
            .and_then(T::from_object_mut)
            .ok_or(KernelError::NotFound)
    }

    /// Remove an object of kind `T`
    pub fn remove<T: ObjectKind>(&mut self, id: u32) -> KernelResult<T> {
        match self.objects.get(&id) {
            Some(object) if object.object_type() == T::TYPE => {}
            _ => return Err(KernelError::NotFound),
        }
        let object = self.objects.remove(&id).ok_or(KernelError::NotFound)?;
        log::debug!("destroyed {:?} {:#010x}", T::TYPE, id);
        T::from_owned(object).map_err(|_| KernelError::NotFound)
    }

    /// Whether any object lives under `id`
    pub fn exists(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    /// Kind of the object under `id`
    pub fn type_of(&self, id: u32) -> Option<ObjectType> {
        self.objects.get(&id).map(KernelObject::object_type)
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Protocol;

    fn semaphore() -> Semaphore {
        Semaphore::new(Protocol::Fifo, 0, 1, 0)
    }

    #[test]
    fn test_ids_carry_kind_base() {
        let mut table = ObjectTable::default();
        let id = table.create(semaphore()).unwrap();
        assert_eq!(id & 0xFF00_0000, ObjectType::Semaphore.id_base());
        assert_eq!(table.type_of(id), Some(ObjectType::Semaphore));
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table = ObjectTable::default();
        let first = table.create(semaphore()).unwrap();
        table.remove::<Semaphore>(first).unwrap();
        let second = table.create(semaphore()).unwrap();
        assert_ne!(first, second);
        assert!(!table.exists(first));
        assert!(table.exists(second));
    }

    #[test]
    fn test_wrong_kind_is_not_found() {
        let mut table = ObjectTable::default();
        let id = table.create(semaphore()).unwrap();
        assert!(matches!(table.get::<Mutex>(id), Err(KernelError::NotFound)));
        assert!(matches!(table.remove::<Mutex>(id), Err(KernelError::NotFound)));
        assert!(table.exists(id));
    }

    #[test]
    fn test_limit_is_enforced() {
        let mut table = ObjectTable::new(Some(2));
        table.create(semaphore()).unwrap();
        table.create(semaphore()).unwrap();
        assert!(matches!(table.create(semaphore()), Err(KernelError::TableFull)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_create_with_sees_id() {
        let mut table = ObjectTable::default();
        let id = table
            .create_with(|id| EventPort::new(crate::sync::EventPortKind::Local, id as u64))
            .unwrap();
        assert_eq!(table.get::<EventPort>(id).unwrap().name(), id as u64);
    }
}
