//! The machine an executing program runs on: its memory image, heap, and the
//! runtime its instrumentation talks to.

use crate::il;
use crate::runtime::{
    AllocationTable, Aspace, AspaceBuilder, FirstFitAllocator, HostMemory, PhysicalAllocator,
    Protection, RegionInfo, Runtime, SparseMemory, TrackerConfig,
};
use crate::Error;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Functions are given addresses here, one every `FUNCTION_STRIDE` bytes.
pub const TEXT_BASE: u64 = 0x1000_0000;
pub const FUNCTION_STRIDE: u64 = 0x10;
pub const GLOBAL_BASE: u64 = 0x2000_0000;
pub const HEAP_BASE: u64 = 0x4000_0000;
pub const HEAP_SIZE: u64 = 0x1000_0000;
pub const STACK_BASE: u64 = 0x7000_0000;
pub const STACK_SIZE: u64 = 0x10_0000;

fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    (value + alignment - 1) / alignment * alignment
}

/// Where the functions and globals of a program live.
#[derive(Clone, Debug, Default)]
pub struct Image {
    functions: BTreeMap<String, u64>,
    by_address: BTreeMap<u64, String>,
    globals: BTreeMap<String, u64>,
    text_end: u64,
    globals_end: u64,
}

impl Image {
    pub fn new(program: &il::Program) -> Image {
        let mut image = Image {
            text_end: TEXT_BASE,
            globals_end: GLOBAL_BASE,
            ..Image::default()
        };
        for function in program.functions() {
            let address = image.text_end;
            image.functions.insert(function.name().to_string(), address);
            image.by_address.insert(address, function.name().to_string());
            image.text_end += FUNCTION_STRIDE;
        }
        for global in program.globals() {
            let address = align_up(image.globals_end, global.ty().alignment());
            image.globals.insert(global.name().to_string(), address);
            image.globals_end = address + global.size_in_bytes().max(1);
        }
        image
    }

    pub fn function_address(&self, name: &str) -> Option<u64> {
        self.functions.get(name).cloned()
    }

    /// The function at `address`.
    pub fn function_at(&self, address: u64) -> Option<&str> {
        self.by_address.get(&address).map(|name| name.as_str())
    }

    pub fn global_address(&self, name: &str) -> Option<u64> {
        self.globals.get(name).cloned()
    }

    /// The region holding every function address.
    pub fn text(&self) -> RegionInfo {
        RegionInfo::new(
            TEXT_BASE,
            (self.text_end - TEXT_BASE).max(FUNCTION_STRIDE),
            Protection::READ | Protection::EXEC,
        )
    }
}

/// Memory, heap and runtime for one execution.
pub struct Machine {
    memory: Arc<SparseMemory>,
    heap: Arc<FirstFitAllocator>,
    runtime: Arc<Runtime>,
    image: Image,
}

impl Machine {
    /// A machine for `program`. The runtime's address space tracks the stack
    /// and the text from the start.
    pub fn new(program: &il::Program, config: TrackerConfig) -> Result<Machine, Error> {
        let image = Image::new(program);
        let memory = Arc::new(SparseMemory::new());
        let heap = Arc::new(FirstFitAllocator::new(HEAP_BASE, HEAP_SIZE));
        let table = Arc::new(AllocationTable::new(memory.clone()));
        let aspace = AspaceBuilder::new("carat", heap.clone(), table.clone())
            .config(config)
            .stack(RegionInfo::new(STACK_BASE, STACK_SIZE, Protection::RW))
            .blob(image.text())
            .build()?;
        Ok(Machine {
            memory,
            heap,
            runtime: Arc::new(Runtime::new(Arc::new(aspace), table)),
            image,
        })
    }

    pub fn memory(&self) -> &Arc<SparseMemory> {
        &self.memory
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn aspace(&self) -> &Arc<Aspace> {
        self.runtime.aspace()
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn heap(&self) -> &Arc<FirstFitAllocator> {
        &self.heap
    }

    pub fn stack_top(&self) -> u64 {
        STACK_BASE + STACK_SIZE
    }

    pub fn malloc(&self, size: u64) -> u64 {
        self.heap.alloc(size).unwrap_or(0)
    }

    pub fn calloc(&self, count: u64, size: u64) -> Result<u64, Error> {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => return Ok(0),
        };
        let ptr = self.malloc(total);
        if ptr != 0 {
            self.memory.write(ptr, &vec![0u8; total as usize])?;
        }
        Ok(ptr)
    }

    pub fn realloc(&self, old: u64, size: u64) -> Result<u64, Error> {
        if old == 0 {
            return Ok(self.malloc(size));
        }
        if size == 0 {
            self.free(old);
            return Ok(0);
        }
        let ptr = self.malloc(size);
        if ptr == 0 {
            return Ok(0);
        }
        let old_size = self.heap.block_size(old).unwrap_or(0);
        self.memory.copy(old, ptr, old_size.min(size))?;
        self.free(old);
        Ok(ptr)
    }

    pub fn free(&self, ptr: u64) {
        if ptr != 0 {
            self.heap.free(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::AddressSpace;

    fn program() -> il::Program {
        let mut program = il::Program::new();
        program.add_function(il::Function::declaration("f", vec![], il::Type::Void));
        program.add_function(il::Function::declaration("g", vec![], il::Type::Void));
        program.add_global(il::GlobalVariable::new(
            "byte",
            il::Type::Integer(8),
            il::Linkage::External,
        ));
        program.add_global(il::GlobalVariable::new(
            "word",
            il::Type::Integer(64),
            il::Linkage::External,
        ));
        program
    }

    #[test]
    fn image_layout() {
        let image = Image::new(&program());

        let f = image.function_address("f").unwrap();
        assert_eq!(image.function_at(f), Some("f"));
        assert_ne!(image.function_address("g"), Some(f));
        assert_eq!(image.text().length, 2 * FUNCTION_STRIDE);

        let byte = image.global_address("byte").unwrap();
        let word = image.global_address("word").unwrap();
        assert_eq!(word % 8, 0);
        assert!(word >= byte + 1);
    }

    #[test]
    fn machine_tracks_stack_and_text() {
        let machine = Machine::new(&program(), TrackerConfig::default()).unwrap();
        let aspace = machine.aspace();

        assert_eq!(aspace.len().unwrap(), 2);
        aspace
            .request_permission(machine.image().function_address("g").unwrap(), crate::AccessKind::Read)
            .unwrap();
        assert!(aspace
            .request_permission(TEXT_BASE, crate::AccessKind::Write)
            .is_err());
        aspace
            .request_permission(machine.stack_top() - 8, crate::AccessKind::Write)
            .unwrap();
    }

    #[test]
    fn realloc_copies_contents() {
        let machine = Machine::new(&program(), TrackerConfig::default()).unwrap();
        let a = machine.calloc(4, 4).unwrap();
        machine.memory().write_u64(a, 0x1234).unwrap();

        let b = machine.realloc(a, 64).unwrap();
        assert_ne!(a, b);
        assert_eq!(machine.memory().read_u64(b).unwrap(), 0x1234);
        assert_eq!(machine.heap().block_size(a), None);
        assert_eq!(machine.realloc(b, 0).unwrap(), 0);
    }
}
