// src/plugins/register.rs

use crate::core::registry::{Invocation, MethodTable, Queueable};

/// `register.add({name})` and `register.remove({name})`: toggles the gates read by
/// `queueRegister`.
#[derive(Debug)]
pub struct RegisterPlugin {
    methods: MethodTable,
}

impl RegisterPlugin {
    pub fn new() -> Self {
        Self {
            methods: MethodTable::new().with("add", add).with("remove", remove),
        }
    }
}

impl Default for RegisterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Queueable for RegisterPlugin {
    fn start(&self, invocation: Invocation) {
        self.methods.dispatch(invocation);
    }
}

fn add(invocation: Invocation) {
    if let Some((invocation, name)) = super::required_str(invocation, "name") {
        invocation.engine().add_register(&name);
        invocation.ok();
    }
}

fn remove(invocation: Invocation) {
    if let Some((invocation, name)) = super::required_str(invocation, "name") {
        invocation.engine().remove_register(&name);
        invocation.ok();
    }
}
