//! Loaded classes and per-method run state.
//!
//! The breakpoint coordinator flips methods between their compiled and
//! interpreted entry points and resets jit vtables. [`ClassTable`] is the
//! state it works on.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use revert_core::{ClassId, CodeId, DecompError, DecompResult, Method, MethodId, ObjectRef};

// =============================================================================
// Run State
// =============================================================================

/// Where invocations of a method go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAddress {
    /// The interpreter; the method may be queued for compilation.
    NotTranslated,
    /// A compiled body.
    Compiled(CodeId),
}

/// One slot of a class's jit vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitVTableSlot {
    /// Calls go through the send target that enters the interpreter.
    NotTranslated,
    /// Calls go directly to a compiled body.
    Compiled(CodeId),
    /// The slot must not be used.
    Invalid,
}

/// Per-method run state.
#[derive(Debug, Clone)]
pub struct MethodEntry {
    /// Method shape.
    pub method: Arc<Method>,
    /// Current entry point.
    pub run_address: RunAddress,
    /// Carries at least one code breakpoint.
    pub breakpointed: bool,
    /// The JIT must not compile this method.
    pub untranslateable: bool,
}

// =============================================================================
// Class
// =============================================================================

/// A loaded class.
#[derive(Debug, Clone)]
pub struct Class {
    /// Class identity.
    pub id: ClassId,
    /// Java-level class object, used as the monitor of static synchronized methods.
    pub class_object: ObjectRef,
    /// Declared methods.
    pub methods: Vec<MethodId>,
    /// Interpreter vtable, by slot.
    pub vtable: Vec<MethodId>,
    /// Compiled-code vtable, parallel to `vtable`.
    pub jit_vtable: Vec<JitVTableSlot>,
    /// Interfaces have no vtable to reset.
    pub is_interface: bool,
    /// Replaced by a redefinition.
    pub obsolete: bool,
}

impl Class {
    /// A class with no methods.
    pub fn new(id: ClassId, class_object: ObjectRef) -> Self {
        Self {
            id,
            class_object,
            methods: Vec::new(),
            vtable: Vec::new(),
            jit_vtable: Vec::new(),
            is_interface: false,
            obsolete: false,
        }
    }

    /// Set the vtable; jit slots start as not translated.
    pub fn with_vtable(mut self, vtable: Vec<MethodId>) -> Self {
        self.jit_vtable = vec![JitVTableSlot::NotTranslated; vtable.len()];
        self.vtable = vtable;
        self
    }

    /// Mark the class as an interface.
    pub fn interface(mut self) -> Self {
        self.is_interface = true;
        self
    }
}

// =============================================================================
// Class Table
// =============================================================================

/// All loaded classes and methods.
#[derive(Debug, Default)]
pub struct ClassTable {
    classes: Vec<Class>,
    methods: FxHashMap<MethodId, MethodEntry>,
}

impl ClassTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class.
    pub fn define_class(&mut self, class: Class) {
        self.classes.push(class);
    }

    /// Register a method, attaching it to its declaring class if present.
    pub fn define_method(&mut self, method: Method) -> Arc<Method> {
        let method = Arc::new(method);
        if let Some(class) = self.classes.iter_mut().find(|c| c.id == method.class) {
            class.methods.push(method.id);
        }
        self.methods.insert(
            method.id,
            MethodEntry {
                method: Arc::clone(&method),
                run_address: RunAddress::NotTranslated,
                breakpointed: false,
                untranslateable: false,
            },
        );
        method
    }

    /// Method shape by id.
    pub fn method(&self, id: MethodId) -> DecompResult<&Arc<Method>> {
        self.entry(id).map(|entry| &entry.method)
    }

    /// Run state by id.
    pub fn entry(&self, id: MethodId) -> DecompResult<&MethodEntry> {
        self.methods.get(&id).ok_or(DecompError::UnknownMethod(id))
    }

    /// Run state by id, mutably.
    pub fn entry_mut(&mut self, id: MethodId) -> DecompResult<&mut MethodEntry> {
        self.methods.get_mut(&id).ok_or(DecompError::UnknownMethod(id))
    }

    /// Point a method at a compiled body.
    pub fn set_compiled(&mut self, id: MethodId, code: CodeId) -> DecompResult<()> {
        self.entry_mut(id)?.run_address = RunAddress::Compiled(code);
        Ok(())
    }

    /// Class by id.
    pub fn class(&self, id: ClassId) -> Option<&Class> {
        self.classes.iter().find(|c| c.id == id)
    }

    /// Class by id, mutably.
    pub fn class_mut(&mut self, id: ClassId) -> Option<&mut Class> {
        self.classes.iter_mut().find(|c| c.id == id)
    }

    /// All classes.
    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    /// All classes, mutably.
    pub fn classes_mut(&mut self) -> &mut [Class] {
        &mut self.classes
    }

    /// All method entries, mutably.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut MethodEntry> {
        self.methods.values_mut()
    }

    /// Rebuild a class's jit vtable from the current run addresses.
    pub fn fill_jit_vtable(&mut self, class: ClassId) {
        let Some(index) = self.classes.iter().position(|c| c.id == class) else {
            return;
        };
        let slots: Vec<JitVTableSlot> = self.classes[index]
            .vtable
            .iter()
            .map(|id| match self.methods.get(id).map(|entry| entry.run_address) {
                Some(RunAddress::Compiled(code)) => JitVTableSlot::Compiled(code),
                Some(RunAddress::NotTranslated) => JitVTableSlot::NotTranslated,
                None => JitVTableSlot::Invalid,
            })
            .collect();
        self.classes[index].jit_vtable = slots;
    }
}
