use crate::database::Database;
use anyhow::{Context, Result};
use serde::Serialize;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

/// Handle the databases command
#[allow(clippy::disallowed_methods)]
pub async fn handle_databases(database: &Database, json: bool) -> Result<()> {
    let list = database
        .list_databases()
        .await
        .context("Failed to list databases")?;

    if json {
        return print_json(&list);
    }
    for name in &list.databases {
        println!("{name}");
    }
    println!("({} databases)", list.count);
    Ok(())
}

/// Handle the schemas command
#[allow(clippy::disallowed_methods)]
pub async fn handle_schemas(database: &Database, json: bool) -> Result<()> {
    let list = database
        .list_schemas()
        .await
        .context("Failed to list schemas")?;

    if json {
        return print_json(&list);
    }
    for name in &list.schemas {
        println!("{name}");
    }
    println!("({} schemas)", list.count);
    Ok(())
}

/// Handle the tables command
#[allow(clippy::disallowed_methods)]
pub async fn handle_tables(database: &Database, schema: Option<&str>, json: bool) -> Result<()> {
    let schema = schema.unwrap_or_else(|| database.default_schema());
    let list = database
        .list_tables(schema)
        .await
        .with_context(|| format!("Failed to list tables in schema '{schema}'"))?;

    if json {
        return print_json(&list);
    }
    for name in &list.tables {
        println!("{}.{name}", list.schema);
    }
    println!("({} tables)", list.count);
    Ok(())
}
