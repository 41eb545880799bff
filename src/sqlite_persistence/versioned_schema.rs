use anyhow::{bail, Result};
use rusqlite::{params, types::Type, Connection};

pub const BASE_DB_VERSION: usize = 99999;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // Only mutated when optional field assignments are passed
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
                foreign_key: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
        }
    }

    fn parse(s: &str) -> Option<&'static SqlType> {
        match s {
            "TEXT" => Some(&SqlType::Text),
            "INTEGER" => Some(&SqlType::Integer),
            "REAL" => Some(&SqlType::Real),
            _ => None,
        }
    }
}

#[allow(unused)]
pub enum ForeignKeyOnChange {
    NoAction,
    Restrict,
    Cascade,
}

impl ForeignKeyOnChange {
    fn as_sql(&self) -> &'static str {
        match self {
            ForeignKeyOnChange::NoAction => "NO ACTION",
            ForeignKeyOnChange::Restrict => "RESTRICT",
            ForeignKeyOnChange::Cascade => "CASCADE",
        }
    }
}

pub struct ForeignKey {
    pub foreign_table: &'static str,
    pub foreign_column: &'static str,
    pub on_delete: ForeignKeyOnChange,
}

pub struct Column<'a, S: AsRef<str>> {
    pub name: S,
    pub sql_type: &'a SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<S>,
    pub foreign_key: Option<&'a ForeignKey>,
}

/// An index over one or more columns of a table.
///
/// `predicate` turns the index into a partial index (`WHERE ...`), which is how
/// "at most one row with flag = 1" invariants are expressed.
pub struct Index {
    pub name: &'static str,
    pub columns: &'static str,
    pub unique: bool,
    pub predicate: Option<&'static str>,
}

impl Index {
    pub const fn plain(name: &'static str, columns: &'static str) -> Self {
        Self {
            name,
            columns,
            unique: false,
            predicate: None,
        }
    }

    fn create_sql(&self, table: &str) -> String {
        let mut sql = format!(
            "CREATE {}INDEX {} ON {}({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            table,
            self.columns
        );
        if let Some(predicate) = self.predicate {
            sql.push_str(&format!(" WHERE {}", predicate));
        }
        sql
    }
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column<'static, &'static str>],
    pub indices: &'static [Index],
    pub unique_constraints: &'static [&'static [&'static str]],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let mut create_sql = format!("CREATE TABLE {} (", self.name);
        let primary_keys: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name)
            .collect();
        let composite_pk = primary_keys.len() > 1;

        for (column_index, column) in self.columns.iter().enumerate() {
            if column_index > 0 {
                create_sql.push_str(", ");
            }
            create_sql.push_str(&format!("{} {}", column.name, column.sql_type.as_sql()));
            if column.is_primary_key && !composite_pk {
                create_sql.push_str(" PRIMARY KEY");
            }
            if column.non_null {
                create_sql.push_str(" NOT NULL");
            }
            if let Some(default_value) = column.default_value {
                create_sql.push_str(&format!(" DEFAULT {}", default_value));
            }
            if let Some(foreign_key) = column.foreign_key {
                create_sql.push_str(&format!(
                    " REFERENCES {}({}) ON DELETE {}",
                    foreign_key.foreign_table,
                    foreign_key.foreign_column,
                    foreign_key.on_delete.as_sql()
                ));
            }
        }

        if composite_pk {
            create_sql.push_str(&format!(", PRIMARY KEY ({})", primary_keys.join(", ")));
        }
        for unique_constraint in self.unique_constraints {
            create_sql.push_str(&format!(", UNIQUE ({})", unique_constraint.join(", ")));
        }
        create_sql.push_str(");");
        conn.execute(&create_sql, params![])?;

        for index in self.indices {
            conn.execute(&index.create_sql(self.name), params![])?;
        }
        Ok(())
    }

    fn validate(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual_columns: Vec<Column<'_, String>> = stmt
            .query_map(params![], |row| {
                let type_name: String = row.get(2)?;
                let sql_type = SqlType::parse(&type_name).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(2, type_name.clone(), Type::Text)
                })?;
                Ok(Column {
                    name: row.get(1)?,
                    sql_type,
                    non_null: row.get::<_, i32>(3)? == 1,
                    default_value: row.get::<_, Option<String>>(4)?,
                    is_primary_key: row.get::<_, i32>(5)? > 0,
                    foreign_key: None,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        if actual_columns.len() != self.columns.len() {
            bail!(
                "Table {} has {} columns, expected {}. Found: {}",
                self.name,
                actual_columns.len(),
                self.columns.len(),
                actual_columns
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        for (actual, expected) in actual_columns.iter().zip(self.columns.iter()) {
            if actual.name != expected.name {
                bail!(
                    "Table {} column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    actual.name
                );
            }
            if actual.sql_type != expected.sql_type {
                bail!(
                    "Table {} column {} type mismatch: expected {:?}, got {:?}",
                    self.name,
                    expected.name,
                    expected.sql_type,
                    actual.sql_type
                );
            }
            if actual.non_null != expected.non_null {
                bail!(
                    "Table {} column {} non-null mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.non_null,
                    actual.non_null
                );
            }
            if actual.is_primary_key != expected.is_primary_key {
                bail!(
                    "Table {} column {} primary key mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.is_primary_key,
                    actual.is_primary_key
                );
            }
        }

        for index in self.indices {
            let index_exists = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1 AND tbl_name=?2",
                    params![index.name, self.name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !index_exists {
                bail!("Table {} is missing index '{}'", self.name, index.name);
            }
        }

        // PRAGMA foreign_key_list: id, seq, table, from, to, on_update, on_delete, match
        let mut fk_stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", self.name))?;
        let actual_fks: Vec<(String, String, String)> = fk_stmt
            .query_map([], |row| Ok((row.get(3)?, row.get(2)?, row.get(4)?)))?
            .collect::<rusqlite::Result<_>>()?;

        for column in self.columns {
            if let Some(expected_fk) = column.foreign_key {
                let found = actual_fks.iter().any(|(from, to_table, to_column)| {
                    from == column.name
                        && to_table == expected_fk.foreign_table
                        && to_column == expected_fk.foreign_column
                });
                if !found {
                    bail!(
                        "Table {} column {} is missing foreign key: expected REFERENCES {}({})",
                        self.name,
                        column.name,
                        expected_fk.foreign_table,
                        expected_fk.foreign_column
                    );
                }
            }
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", params![])?;
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARENT_TABLE: Table = Table {
        name: "parent",
        columns: &[sqlite_column!("id", &SqlType::Text, is_primary_key = true)],
        indices: &[],
        unique_constraints: &[],
    };

    const PARENT_FK: ForeignKey = ForeignKey {
        foreign_table: "parent",
        foreign_column: "id",
        on_delete: ForeignKeyOnChange::Restrict,
    };

    const CHILD_TABLE: Table = Table {
        name: "child",
        columns: &[
            sqlite_column!("id", &SqlType::Text, is_primary_key = true),
            sqlite_column!(
                "parent_id",
                &SqlType::Text,
                non_null = true,
                foreign_key = Some(&PARENT_FK)
            ),
            sqlite_column!("flag", &SqlType::Integer, non_null = true, default_value = Some("0")),
        ],
        indices: &[
            Index::plain("idx_child_parent", "parent_id"),
            Index {
                name: "idx_child_single_flag",
                columns: "flag",
                unique: true,
                predicate: Some("flag = 1"),
            },
        ],
        unique_constraints: &[],
    };

    const PAIR_TABLE: Table = Table {
        name: "pair",
        columns: &[
            sqlite_column!("a", &SqlType::Text, is_primary_key = true),
            sqlite_column!("b", &SqlType::Text, is_primary_key = true),
            sqlite_column!("value", &SqlType::Real),
        ],
        indices: &[],
        unique_constraints: &[],
    };

    fn schema() -> VersionedSchema {
        VersionedSchema {
            version: 0,
            tables: &[PARENT_TABLE, CHILD_TABLE, PAIR_TABLE],
            migration: None,
        }
    }

    #[test]
    fn test_create_then_validate() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = schema();
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, BASE_DB_VERSION as i64);
    }

    #[test]
    fn test_partial_unique_index_allows_single_flagged_row() {
        let conn = Connection::open_in_memory().unwrap();
        schema().create(&conn).unwrap();
        conn.execute("INSERT INTO parent (id) VALUES ('p')", []).unwrap();
        conn.execute(
            "INSERT INTO child (id, parent_id, flag) VALUES ('a', 'p', 1), ('b', 'p', 0), ('c', 'p', 0)",
            [],
        )
        .unwrap();

        let second_flag = conn.execute("UPDATE child SET flag = 1 WHERE id = 'b'", []);
        assert!(second_flag.is_err());
    }

    #[test]
    fn test_composite_primary_key() {
        let conn = Connection::open_in_memory().unwrap();
        schema().create(&conn).unwrap();
        conn.execute("INSERT INTO pair (a, b, value) VALUES ('x', 'y', 1.0)", [])
            .unwrap();
        conn.execute("INSERT INTO pair (a, b, value) VALUES ('x', 'z', 1.0)", [])
            .unwrap();
        assert!(conn
            .execute("INSERT INTO pair (a, b, value) VALUES ('x', 'y', 2.0)", [])
            .is_err());
    }

    #[test]
    fn test_validate_detects_missing_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE parent (id TEXT PRIMARY KEY)", [])
            .unwrap();
        conn.execute(
            "CREATE TABLE child (id TEXT PRIMARY KEY, parent_id TEXT NOT NULL REFERENCES parent(id), flag INTEGER NOT NULL DEFAULT 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE TABLE pair (a TEXT, b TEXT, value REAL, PRIMARY KEY (a, b))",
            [],
        )
        .unwrap();

        let err = schema().validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing index"));
        assert!(err.contains("idx_child_parent"));
    }

    #[test]
    fn test_validate_detects_missing_foreign_key() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE parent (id TEXT PRIMARY KEY)", [])
            .unwrap();
        conn.execute(
            "CREATE TABLE child (id TEXT PRIMARY KEY, parent_id TEXT NOT NULL, flag INTEGER NOT NULL DEFAULT 0)",
            [],
        )
        .unwrap();
        conn.execute("CREATE INDEX idx_child_parent ON child(parent_id)", [])
            .unwrap();
        conn.execute(
            "CREATE UNIQUE INDEX idx_child_single_flag ON child(flag) WHERE flag = 1",
            [],
        )
        .unwrap();

        let err = VersionedSchema {
            version: 0,
            tables: &[PARENT_TABLE, CHILD_TABLE],
            migration: None,
        }
        .validate(&conn)
        .unwrap_err()
        .to_string();
        assert!(err.contains("missing foreign key"));
        assert!(err.contains("parent_id"));
    }

    #[test]
    fn test_validate_detects_column_count_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE parent (id TEXT PRIMARY KEY, extra TEXT)", [])
            .unwrap();

        let err = VersionedSchema {
            version: 0,
            tables: &[PARENT_TABLE],
            migration: None,
        }
        .validate(&conn)
        .unwrap_err()
        .to_string();
        assert!(err.contains("has 2 columns, expected 1"));
    }
}
