//! Code-defined billing rule templates.
//!
//! Each module exports `TEMPLATES`; `rule_templates::discover_rule_templates`
//! collects them. Adding a billing mode is additive: new module, one list
//! entry, no central registry edits.

pub mod universal;
