use crate::prelude::*;
use rusqlite::{Connection, Transaction};
use std::collections::HashSet;

enum MigrationKind {
    SQL(&'static str),
    #[allow(dead_code, clippy::type_complexity)]
    Code(Box<dyn Fn(&Transaction) -> ::rusqlite::Result<()>>),
}

fn migrations() -> Vec<(&'static str, MigrationKind)> {
    let mut migrations = Vec::new();

    migrations.push((
        "initial",
        MigrationKind::SQL(
            "
            CREATE TABLE datasets (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                readme TEXT,
                df TEXT NOT NULL,
                has_query INTEGER NOT NULL,
                has_output INTEGER NOT NULL,
                has_output_true INTEGER NOT NULL,
                size INTEGER NOT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE models (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL,
                prompt_system TEXT,
                sampling_params TEXT,
                extra_params TEXT,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE experiment_sets (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                readme TEXT,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE experiments (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                readme TEXT,
                experiment_status TEXT NOT NULL,
                dataset_id INTEGER NOT NULL,
                model_id INTEGER,
                experiment_set_id INTEGER,

                num_try INTEGER NOT NULL DEFAULT 0,
                num_success INTEGER NOT NULL DEFAULT 0,
                num_observation_try INTEGER NOT NULL DEFAULT 0,
                num_observation_success INTEGER NOT NULL DEFAULT 0,
                num_metrics INTEGER NOT NULL DEFAULT 0,

                created_at DATETIME NOT NULL,

                UNIQUE (experiment_set_id, name),
                FOREIGN KEY (dataset_id) REFERENCES datasets(id),
                FOREIGN KEY (model_id) REFERENCES models(id),
                FOREIGN KEY (experiment_set_id)
                    REFERENCES experiment_sets(id) ON DELETE CASCADE
            );

            CREATE TABLE results (
                id INTEGER PRIMARY KEY,
                experiment_id INTEGER NOT NULL,
                metric_name TEXT NOT NULL,
                metric_status TEXT NOT NULL,
                num_try INTEGER NOT NULL DEFAULT 0,
                num_success INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,

                UNIQUE (experiment_id, metric_name),
                FOREIGN KEY (experiment_id)
                    REFERENCES experiments(id) ON DELETE CASCADE
            );

            CREATE TABLE answers (
                id INTEGER PRIMARY KEY,
                experiment_id INTEGER NOT NULL,
                num_line INTEGER NOT NULL,
                answer TEXT,
                error_msg TEXT,
                execution_time INTEGER,
                metadata TEXT,
                created_at DATETIME NOT NULL,

                UNIQUE (experiment_id, num_line),
                FOREIGN KEY (experiment_id)
                    REFERENCES experiments(id) ON DELETE CASCADE
            );

            CREATE TABLE observations (
                id INTEGER PRIMARY KEY,
                result_id INTEGER NOT NULL,
                num_line INTEGER NOT NULL,
                score REAL,
                observation TEXT,
                error_msg TEXT,
                execution_time INTEGER,
                created_at DATETIME NOT NULL,

                UNIQUE (result_id, num_line),
                FOREIGN KEY (result_id)
                    REFERENCES results(id) ON DELETE CASCADE
            );
            ",
        ),
    ));

    migrations.push((
        "add_listing_indexes",
        MigrationKind::SQL(
            "
            CREATE INDEX experiments__set ON experiments (experiment_set_id);
            CREATE INDEX results__experiment ON results (experiment_id);
            CREATE INDEX answers__experiment ON answers (experiment_id);
            CREATE INDEX observations__result ON observations (result_id);
            ",
        ),
    ));

    migrations.push((
        "add_leaderboard_score_index",
        MigrationKind::SQL(
            "
            CREATE INDEX observations__result_score ON observations (result_id, score);
            ",
        ),
    ));

    migrations
}

pub fn execute(db: &mut Connection) -> Fallible<()> {
    // If the database version is 0, create the migrations table and bump it
    let version: i32 = db.query_row("PRAGMA user_version;", [], |r| r.get(0))?;
    if version == 0 {
        db.execute("CREATE TABLE IF NOT EXISTS migrations (name TEXT PRIMARY KEY);", [])?;
        db.execute("PRAGMA user_version = 1;", [])?;
    }

    let executed_migrations = {
        let mut prepared = db.prepare("SELECT name FROM migrations;")?;
        let mut result = HashSet::new();
        for value in prepared.query_map([], |row| row.get::<_, String>(0))? {
            result.insert(value?);
        }

        result
    };

    for &(name, ref migration) in &migrations() {
        if !executed_migrations.contains(name) {
            let t = db.transaction()?;
            match migration {
                MigrationKind::SQL(sql) => t.execute_batch(sql),
                MigrationKind::Code(code) => code(&t),
            }
            .with_context(|| format!("error running migration: {name}"))?;

            t.execute("INSERT INTO migrations (name) VALUES (?1)", [&name])?;
            t.commit()?;

            info!("executed migration: {}", name);
        }
    }

    Ok(())
}
