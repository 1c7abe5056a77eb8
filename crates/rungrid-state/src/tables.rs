//! redb table definitions for the rungrid state store.
//!
//! Each table uses `&str` keys (`{namespace}/{name}`) and `&[u8]` values
//! (JSON-serialized objects).

use redb::TableDefinition;

use crate::meta::ObjectKind;

pub const SCALE_TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("scale_targets");

pub const AUTOSCALERS: TableDefinition<&str, &[u8]> = TableDefinition::new("autoscalers");

pub const OWNERS: TableDefinition<&str, &[u8]> = TableDefinition::new("owners");

pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

pub const CREDENTIALS: TableDefinition<&str, &[u8]> = TableDefinition::new("credentials");

/// Table backing a given object kind.
pub fn table_for(kind: ObjectKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        ObjectKind::ScaleTarget => SCALE_TARGETS,
        ObjectKind::HorizontalAutoscaler => AUTOSCALERS,
        ObjectKind::Owner => OWNERS,
        ObjectKind::Agent => AGENTS,
        ObjectKind::Credential => CREDENTIALS,
    }
}
