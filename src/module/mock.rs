//! Mock implementations of the host-runtime handles, for tests.

use crate::module::{
    FunctionInstanceHandle, InstanceId, ModuleHandle, ModuleId, ModuleInstanceHandle, ValType,
};

/// Builder for a [`MockModule`].
pub struct MockModuleBuilder {
    module_id: ModuleId,
    host_module: bool,
    types: Vec<(Vec<ValType>, Vec<ValType>)>,
    func_type_indices: Vec<u32>,
    import_func_count: u32,
    codes: Vec<(Vec<ValType>, Vec<u8>)>,
    local_memories: u32,
    imported_memories: u32,
    memory_min_max: Option<(u32, u32)>,
}

impl MockModuleBuilder {
    pub fn new(module_id: ModuleId) -> Self {
        MockModuleBuilder {
            module_id,
            host_module: false,
            types: vec![],
            func_type_indices: vec![],
            import_func_count: 0,
            codes: vec![],
            local_memories: 0,
            imported_memories: 0,
            memory_min_max: None,
        }
    }

    pub fn with_type(mut self, params: &[ValType], results: &[ValType]) -> Self {
        self.types.push((params.to_vec(), results.to_vec()));
        self
    }

    /// Declare an imported function of type `type_idx`. Imported functions
    /// must be declared before any code.
    pub fn with_imported_func(mut self, type_idx: u32) -> Self {
        assert!(self.codes.is_empty(), "imports must precede defined code");
        self.func_type_indices.push(type_idx);
        self.import_func_count += 1;
        self
    }

    pub fn with_code(mut self, type_idx: u32, locals: &[ValType], body: &[u8]) -> Self {
        self.func_type_indices.push(type_idx);
        self.codes.push((locals.to_vec(), body.to_vec()));
        self
    }

    pub fn with_local_memory(mut self, min: u32, max: u32) -> Self {
        self.local_memories = 1;
        self.memory_min_max = Some((min, max));
        self
    }

    pub fn with_imported_memory(mut self, min: u32, max: u32) -> Self {
        self.imported_memories = 1;
        self.memory_min_max = Some((min, max));
        self
    }

    pub fn with_host_module(mut self, host_module: bool) -> Self {
        self.host_module = host_module;
        self
    }

    pub fn build(self) -> MockModule {
        MockModule {
            module_id: self.module_id,
            host_module: self.host_module,
            types: self.types,
            func_type_indices: self.func_type_indices,
            import_func_count: self.import_func_count,
            codes: self.codes,
            local_memories: self.local_memories,
            imported_memories: self.imported_memories,
            memory_min_max: self.memory_min_max,
        }
    }
}

pub struct MockModule {
    module_id: ModuleId,
    host_module: bool,
    types: Vec<(Vec<ValType>, Vec<ValType>)>,
    func_type_indices: Vec<u32>,
    import_func_count: u32,
    codes: Vec<(Vec<ValType>, Vec<u8>)>,
    local_memories: u32,
    imported_memories: u32,
    memory_min_max: Option<(u32, u32)>,
}

impl ModuleHandle for MockModule {
    fn module_id(&self) -> ModuleId {
        self.module_id
    }

    fn host_module(&self) -> bool {
        self.host_module
    }

    fn type_count(&self) -> u32 {
        self.types.len() as u32
    }

    fn type_at(&self, type_idx: u32) -> (&[ValType], &[ValType]) {
        let (params, results) = &self.types[type_idx as usize];
        (params, results)
    }

    fn func_type_index(&self, func_idx: u32) -> u32 {
        self.func_type_indices[func_idx as usize]
    }

    fn import_func_count(&self) -> u32 {
        self.import_func_count
    }

    fn code_count(&self) -> u32 {
        self.codes.len() as u32
    }

    fn code_at(&self, defined_idx: u32) -> (&[ValType], &[u8]) {
        let (locals, body) = &self.codes[defined_idx as usize];
        (locals, body)
    }

    fn local_memories_count(&self) -> u32 {
        self.local_memories
    }

    fn imported_memories_count(&self) -> u32 {
        self.imported_memories
    }

    fn memory_min_max(&self) -> Option<(u32, u32)> {
        self.memory_min_max
    }
}

/// A mock module instance backed by an owned, pinned memory buffer.
pub struct MockModuleInstance {
    instance_id: InstanceId,
    name: String,
    // Boxed so the buffer address stays put while the instance moves.
    memory: Box<[u8]>,
    imported_memory_ptr: u64,
    imported_instances: Vec<InstanceId>,
    imported_indices: Vec<u32>,
}

impl MockModuleInstance {
    pub fn new(instance_id: InstanceId, name: &str) -> Self {
        MockModuleInstance {
            instance_id,
            name: name.to_owned(),
            memory: Box::new([]),
            imported_memory_ptr: 0,
            imported_instances: vec![],
            imported_indices: vec![],
        }
    }

    pub fn with_memory(mut self, contents: Vec<u8>) -> Self {
        self.memory = contents.into_boxed_slice();
        self
    }

    pub fn with_imported_memory_ptr(mut self, ptr: u64) -> Self {
        self.imported_memory_ptr = ptr;
        self
    }

    pub fn with_imported_func(mut self, from: InstanceId, func_idx: u32) -> Self {
        self.imported_instances.push(from);
        self.imported_indices.push(func_idx);
        self
    }
}

impl ModuleInstanceHandle for MockModuleInstance {
    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn memory_instance_buffer(&self) -> &[u8] {
        &self.memory
    }

    fn imported_memory_instance_ptr(&self) -> u64 {
        self.imported_memory_ptr
    }

    fn imported_functions(&self) -> (Vec<InstanceId>, Vec<u32>) {
        (self.imported_instances.clone(), self.imported_indices.clone())
    }
}

pub struct MockFunctionInstance {
    pub index: u32,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub instance_id: InstanceId,
}

impl FunctionInstanceHandle for MockFunctionInstance {
    fn index(&self) -> u32 {
        self.index
    }

    fn function_type(&self) -> (&[ValType], &[ValType]) {
        (&self.params, &self.results)
    }

    fn module_instance_id(&self) -> InstanceId {
        self.instance_id
    }
}
