//! Rate limit rules: the records, their durable table, and the cached resolver.

mod cache;
mod rule;
mod sqlite;
mod table;

pub use cache::RuleResolver;
pub use rule::{default_seed_rules, NewRule, Rule, RuleUpdate, SeedFile, DEFAULT_RULE_ID};
pub use sqlite::SqliteRuleTable;
pub use table::{MemoryRuleTable, RuleTable, RuleTableError};
