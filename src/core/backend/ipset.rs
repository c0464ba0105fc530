//! `ipset` invocations shared by both backends

use crate::command::CommandRunner;
use crate::core::error::{Error, Result};
use crate::core::network::Family;
use crate::validators::validate_set_name;
use std::sync::Arc;

/// Builds and runs `ipset create|add|destroy` command lines.
///
/// Callers hold the kernel lock.
#[derive(Clone)]
pub struct IpsetCommands {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl IpsetCommands {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    pub fn create_args(&self, name: &str, family: Family) -> Vec<String> {
        vec![
            self.program.clone(),
            "create".to_string(),
            name.to_string(),
            "hash:net".to_string(),
            "family".to_string(),
            family.ipset_family().to_string(),
        ]
    }

    pub fn create(&self, name: &str, family: Family) -> Result<()> {
        validate_set_name(name).map_err(|e| Error::validation("set_name", e))?;
        self.runner.run(&self.create_args(name, family)).map(drop)
    }

    pub fn add(&self, name: &str, network: &str) -> Result<()> {
        let argv = vec![
            self.program.clone(),
            "add".to_string(),
            name.to_string(),
            network.to_string(),
        ];
        self.runner.run(&argv).map(drop)
    }

    pub fn destroy(&self, name: &str) -> Result<()> {
        let argv = vec![
            self.program.clone(),
            "destroy".to_string(),
            name.to_string(),
        ];
        self.runner.run(&argv).map(drop)
    }
}

impl std::fmt::Debug for IpsetCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpsetCommands")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}
