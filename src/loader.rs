//! Program loading
//!
//! The outer tool compiles source into label functions; the runtime consumes
//! only the small surface collected here: the entry label, the refcounting
//! flag, how many breakpoint ids the program was mapped with, and the initial
//! globals the program binds.

use std::collections::HashMap;

use anyhow::{ensure, Result};

use crate::runtime::frame::LabelFnRef;
use crate::values::Value;

/// A compiled program, ready to run
#[derive(Clone)]
pub struct CompiledProgram {
    pub entry_point: LabelFnRef,
    pub ref_counting: bool,
    pub num_breakpoints: usize,
    pub globals: HashMap<String, Value>,
}

impl CompiledProgram {
    pub fn builder(entry_point: LabelFnRef) -> ProgramBuilder {
        ProgramBuilder {
            entry_point,
            ref_counting: false,
            num_breakpoints: 0,
            globals: HashMap::new(),
        }
    }
}

/// Builder for a CompiledProgram
pub struct ProgramBuilder {
    entry_point: LabelFnRef,
    ref_counting: bool,
    num_breakpoints: usize,
    globals: HashMap<String, Value>,
}

impl ProgramBuilder {
    pub fn ref_counting(mut self, on: bool) -> Self {
        self.ref_counting = on;
        self
    }

    pub fn num_breakpoints(mut self, n: usize) -> Self {
        self.num_breakpoints = n;
        self
    }

    pub fn global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    pub fn build(self) -> CompiledProgram {
        CompiledProgram {
            entry_point: self.entry_point,
            ref_counting: self.ref_counting,
            num_breakpoints: self.num_breakpoints,
            globals: self.globals,
        }
    }
}

/// The host's request to run a program
pub struct RunRequest {
    /// Runtime id; generated when absent
    pub id: Option<String>,
    pub program: CompiledProgram,
    /// Track live objects for leak dumps (only meaningful with
    /// `program.ref_counting`)
    pub ref_counting_debug: bool,
}

impl RunRequest {
    pub fn new(program: CompiledProgram) -> Self {
        Self {
            id: None,
            program,
            ref_counting_debug: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_ref_counting_debug(mut self, on: bool) -> Self {
        self.ref_counting_debug = on;
        self
    }

    /// Sanity-check the request before handing it to a runtime
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.ref_counting_debug || self.program.ref_counting,
            "refCountingDebug requires a program compiled with refCounting"
        );
        Ok(())
    }
}
