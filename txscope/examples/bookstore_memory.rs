//! The bookstore handlers run through all three call conventions against the
//! in-memory engine. No backend feature needed:
//!
//! ```sh
//! cargo run -p txscope --example bookstore_memory
//! ```

use std::sync::Arc;

use tests_common::bookstore::{self, ambient, injected, optional, CreateBook};
use tests_common::MemoryEngine;
use txscope::ScopedEngine;

#[tokio::main]
async fn main() -> txscope::DbResult<()> {
    let db = ScopedEngine::new(Arc::new(MemoryEngine::new()));
    bookstore::create_all_tables(&db).await?;

    // Ambient convention: the caller opens the scope, the handler just runs.
    let id = db
        .atomic(|| async {
            ambient::create_book(&db, &CreateBook::with_new_author("Dune", "Frank Herbert")).await
        })
        .await?;
    println!("ambient convention created book {id}");

    // Injected convention: the adapter opens the scope and hands the handler
    // its transaction.
    let id = injected::create_book(
        &db,
        &CreateBook::with_new_author("Emma", "Jane Austen"),
    )
    .await?;
    println!("injected convention created book {id}");

    // Optional-parameter convention, with the parameter omitted.
    let id = db
        .atomic(|| async {
            optional::create_book(
                &db,
                &CreateBook::with_new_author("Solaris", "Stanislaw Lem"),
                None,
            )
            .await
        })
        .await?;
    println!("optional convention created book {id}");

    // A fault between the two writes rolls the whole operation back.
    let err = injected::create_book(&db, &CreateBook::faulty("Unfinished", "Nobody"))
        .await
        .unwrap_err();
    println!("faulty request rolled back: {err}");

    // All three conventions read the same committed state.
    let stats = ambient::get_stats(&db).await?;
    println!(
        "{} books by {} authors",
        stats.book_count, stats.author_count
    );
    for book in injected::get_books(&db).await? {
        println!("  {} by {}", book.title, book.author_name);
    }

    Ok(())
}
