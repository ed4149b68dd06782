use anyhow::Result;

use tidemark::store::Store;
use tidemark::tree::TIME_MAX;
use tidemark::Value;

#[tokio::main]
async fn main() -> Result<()> {
    let key = Value::from("something");

    // Create a store with 4 KiB root blocks
    let store = Store::create("hello.db", 4096).await?;

    // Make sure we can't find "something" in our store
    assert_eq!(store.snapshot().get(&key, TIME_MAX), None);

    // Assign "something" a value of 3
    let k = key.clone();
    store
        .transaction(move |tx| async move {
            let at = tx.timestamp();
            Ok(tx.root().set(&k, Value::from(3), at))
        })
        .await?;

    // Make sure we can find "something" in our store
    assert_eq!(store.snapshot().get(&key, TIME_MAX), Some(Value::from(3)));

    // Close and reopen: the value is durable
    store.close().await?;
    let store = Store::open("hello.db", 4096).await?;
    assert_eq!(store.snapshot().get(&key, TIME_MAX), Some(Value::from(3)));

    store.close().await?;
    std::fs::remove_file("hello.db")?;
    Ok(())
}
