use std::collections::HashMap;

use batchload::{GetPolicy, KvSource, Loader, LoaderOptions, Term};
use serde_json::{json, Value};

// For this example the "backend" is a HashMap captured by the batch
// function; every run fetches all queued keys in one call.
#[tokio::main]
async fn main() {
    let mut films = HashMap::new();
    films.insert(Term::Int(2001), json!("a space odyssey"));
    films.insert(Term::Int(7), json!("samurai"));
    films.insert(Term::Int(12), json!("angry men"));

    let source = KvSource::from_fn(move |_batch, keys| {
        let films = films.clone();
        async move {
            Ok(keys.into_iter().filter_map(|k| films.get(&k).cloned().map(|v| (k, v))).collect())
        }
    });

    let mut loader =
        Loader::with_options(LoaderOptions::new().get_policy(GetPolicy::ReturnNilOnError));
    loader.add_source("films", source);

    loader.load_many("films", "by_id", [7, 12, 2010, 2001]).unwrap();
    loader.run().await;

    assert_eq!(loader.get("films", "by_id", 7).unwrap(), json!("samurai"));
    assert_eq!(loader.get("films", "by_id", 2010).unwrap(), Value::Null);
    assert_eq!(
        loader
            .get_many("films", "by_id", [12, 2001])
            .into_iter()
            .map(Result::unwrap)
            .collect::<Vec<_>>(),
        vec![json!("angry men"), json!("a space odyssey")]
    );
    println!("resolved four loads with one batched fetch");
}
