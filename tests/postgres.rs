use closure_table::{
    AdvisoryLockKey, AdvisoryLockStrategy, ClosureNode, ClosureTableError, ClosureTableOptions,
    HierarchyService,
};
use sea_orm::{
    ActiveValue::NotSet, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, Set,
    Statement,
};

mod entity {
    pub mod node {
        use closure_table::ClosureNodeDerive as ClosureNode;
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, ClosureNode)]
        #[sea_orm(table_name = "pg_nodes")]
        #[closure_table(
            parent_field = "parent_id",
            closure_table = "pg_node_closure",
            distance_column = "generations"
        )]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub name: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::node;

// Both tests truncate the same tables.
static DATABASE: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn named(name: &str, parent: Option<i32>) -> node::ActiveModel {
    node::ActiveModel {
        id: NotSet,
        parent_id: Set(parent),
        name: Set(name.to_owned()),
    }
}

#[tokio::test]
async fn locked_moves_keep_postgres_rows_consistent() -> Result<(), Box<dyn std::error::Error>> {
    let _serial = DATABASE.lock().await;
    let Some(db) = setup_database().await? else {
        return Ok(());
    };
    reset_tables(&db).await?;

    let base = node::Model::closure_config().clone();
    let key = AdvisoryLockKey::derived_from(&base);
    let config = ClosureTableOptions::default()
        .advisory_lock_strategy(AdvisoryLockStrategy::Namespaced(key))
        .apply(base);
    let service = HierarchyService::<node::Model>::with_config(config)?;

    let root = service.create(&db, named("root", None)).await?;
    let child = service.create_child(&db, &root, named("child", None)).await?;
    let other = service.create_child(&db, &root, named("other", None)).await?;
    let leaf = service.create_child(&db, &child, named("leaf", None)).await?;

    let ancestors: Vec<String> = service
        .ancestors(&db, &leaf, false)
        .await?
        .into_iter()
        .map(|node| node.name)
        .collect();
    assert_eq!(ancestors, ["root", "child"]);

    service.move_to(&db, &child, Some(&other.id)).await?;
    let ancestors: Vec<String> = service
        .ancestors(&db, &leaf, false)
        .await?
        .into_iter()
        .map(|node| node.name)
        .collect();
    assert_eq!(ancestors, ["root", "other", "child"]);

    let err = service
        .move_to(&db, &root, Some(&leaf.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ClosureTableError::CycleDetected { .. }));

    assert!(service.verify(&db).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_locked_transactions_release_the_lock() -> Result<(), Box<dyn std::error::Error>> {
    let _serial = DATABASE.lock().await;
    let Some(db) = setup_database().await? else {
        return Ok(());
    };
    reset_tables(&db).await?;

    let base = node::Model::closure_config().clone();
    let key = AdvisoryLockKey::derived_from(&base);
    let config = ClosureTableOptions::default()
        .advisory_lock_strategy(AdvisoryLockStrategy::Namespaced(key))
        .apply(base);
    let service = HierarchyService::<node::Model>::with_config(config)?;

    let root = service.create(&db, named("root", None)).await?;
    let err = service.on_created(&db, &root).await.unwrap_err();
    assert!(matches!(err, ClosureTableError::TransactionFailure(_)));
    assert!(err.is_retryable());

    let held = db
        .query_one(Statement::from_string(
            DbBackend::Postgres,
            "SELECT COUNT(*) AS held FROM pg_locks WHERE locktype = 'advisory'",
        ))
        .await?
        .map(|row| row.try_get::<i64>("", "held"))
        .transpose()?;
    assert_eq!(held, Some(0));

    // Later writers must not wait on a lock left behind by the failure.
    for i in 0..4 {
        let created = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            service.create_child(&db, &root, named(&format!("child {i}"), None)),
        )
        .await?;
        created?;
    }
    assert_eq!(service.children(&db, &root).await?.len(), 4);
    assert!(service.verify(&db).await?.is_empty());
    Ok(())
}

async fn setup_database() -> Result<Option<DatabaseConnection>, DbErr> {
    let url = match std::env::var("CLOSURE_TABLE_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => return Ok(None),
    };

    Database::connect(url).await.map(Some)
}

async fn reset_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    db.execute(Statement::from_string(
        DbBackend::Postgres,
        r#"
        CREATE TABLE IF NOT EXISTS pg_nodes (
            id SERIAL PRIMARY KEY,
            parent_id INTEGER REFERENCES pg_nodes(id) ON DELETE SET NULL,
            name TEXT NOT NULL
        );
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Postgres,
        r#"
        CREATE TABLE IF NOT EXISTS pg_node_closure (
            ancestor INTEGER NOT NULL,
            descendant INTEGER NOT NULL,
            generations INTEGER NOT NULL,
            PRIMARY KEY (ancestor, descendant)
        );
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Postgres,
        "TRUNCATE TABLE pg_node_closure, pg_nodes RESTART IDENTITY;",
    ))
    .await?;

    Ok(())
}
