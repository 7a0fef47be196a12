pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_users_table;
mod m20250301_000002_create_tokens_table;
mod m20250301_000003_create_channels_table;
mod m20250301_000004_create_log_records_table;
mod m20250301_000005_create_log_details_table;
mod m20250301_000006_create_quota_settlements_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_users_table::Migration),
            Box::new(m20250301_000002_create_tokens_table::Migration),
            Box::new(m20250301_000003_create_channels_table::Migration),
            Box::new(m20250301_000004_create_log_records_table::Migration),
            Box::new(m20250301_000005_create_log_details_table::Migration),
            Box::new(m20250301_000006_create_quota_settlements_table::Migration),
        ]
    }
}
