use anyhow::Result;

use tidemark::store::Store;
use tidemark::tree::TIME_MAX;
use tidemark::Value;

#[tokio::main]
async fn main() -> Result<()> {
    let store = Store::create("time_travel.db", 4096).await?;
    let key = Value::from("city");

    // First assignment
    let k = key.clone();
    store
        .transaction(move |tx| async move {
            let at = tx.timestamp();
            Ok(tx.root().set(&k, Value::from("Lisbon"), at))
        })
        .await?;
    let after_first = store.timestamp();

    // Overwrite it
    let k = key.clone();
    store
        .transaction(move |tx| async move {
            let at = tx.timestamp();
            Ok(tx.root().set(&k, Value::from("Porto"), at))
        })
        .await?;

    // The present sees the new value
    assert_eq!(
        store.snapshot().get(&key, TIME_MAX),
        Some(Value::from("Porto"))
    );

    // The past is still there: ask the same root at the older timestamp
    assert_eq!(
        store.snapshot().get(&key, after_first),
        Some(Value::from("Lisbon"))
    );

    // The full history of the key, stamps included
    let history = store.snapshot().history(&key).expect("key has history");
    for entry in history.entries() {
        println!(
            "{} [{} .. {}]",
            entry.value,
            entry.created_at,
            if entry.deleted_at == TIME_MAX {
                "now".to_string()
            } else {
                entry.deleted_at.to_string()
            }
        );
    }

    store.close().await?;
    std::fs::remove_file("time_travel.db")?;
    Ok(())
}
