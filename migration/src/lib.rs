pub use sea_orm_migration::prelude::*;

mod m20260101_000001_create_users_and_voting;
mod m20260101_000002_add_bookings;
mod m20260101_000003_add_email_and_usage_tables;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_create_users_and_voting::Migration),
            Box::new(m20260101_000002_add_bookings::Migration),
            Box::new(m20260101_000003_add_email_and_usage_tables::Migration),
        ]
    }
}

/// Names of table constraints that are not UNIQUE, PRIMARY KEY or FOREIGN KEY.
/// Postgres rejects plain indexes declared inside CREATE TABLE.
#[cfg(test)]
pub(crate) fn bare_constraints(sql: &str) -> Vec<String> {
    sql.split("CONSTRAINT ")
        .skip(1)
        .filter_map(|rest| {
            let (name, tail) = rest.split_once(' ')?;
            let keyed = ["UNIQUE", "PRIMARY KEY", "FOREIGN KEY"]
                .iter()
                .any(|kind| tail.starts_with(kind));
            (!keyed).then(|| name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_index_inside_table_is_flagged() {
        let sql = r#"CREATE TABLE "t" ( "a" integer, CONSTRAINT "idx_t_b" ("b"), CONSTRAINT "uq_t_a" UNIQUE ("a") )"#;
        assert_eq!(bare_constraints(sql), vec![r#""idx_t_b""#.to_string()]);
    }
}
