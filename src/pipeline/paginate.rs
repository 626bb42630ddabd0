//! Cursor-driven "fetch all pages" primitive.
//!
//! [`paginate`] turns a page-fetch function into a lazy stream of items.
//! Pages are fetched one at a time, only when the consumer has drained the
//! previous one. A fetch failure is yielded as the final `Err` item, so
//! everything before it has already been delivered.

use std::future::Future;

use futures::stream::{self, Stream, StreamExt};
use tracing::warn;

use crate::moderation::Page;

enum Cursor {
    Next(Option<String>),
    Done,
}

/// Stream every item across all pages, in fetch order.
///
/// `fetch` receives `None` for the first page and the previous page's
/// cursor afterwards. An absent or empty cursor ends the stream; so does a
/// cursor identical to the one just served, which would otherwise fetch the
/// same page again.
pub fn paginate<T, E, F, Fut>(fetch: F) -> impl Stream<Item = Result<T, E>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    stream::unfold((fetch, Cursor::Next(None)), |(mut fetch, cursor)| async move {
        let current = match cursor {
            Cursor::Done => return None,
            Cursor::Next(current) => current,
        };

        match fetch(current.clone()).await {
            Ok(page) => {
                let next = match page.cursor.filter(|c| !c.is_empty()) {
                    Some(next) if Some(&next) == current.as_ref() => {
                        warn!(cursor = %next, "Service repeated pagination cursor, stopping");
                        Cursor::Done
                    }
                    Some(next) => Cursor::Next(Some(next)),
                    None => Cursor::Done,
                };
                let items: Vec<Result<T, E>> = page.items.into_iter().map(Ok).collect();
                Some((stream::iter(items), (fetch, next)))
            }
            Err(e) => Some((stream::iter(vec![Err(e)]), (fetch, Cursor::Done))),
        }
    })
    .flatten()
}

/// Fully drained pagination result.
#[derive(Debug)]
pub struct Collected<T, E> {
    /// Items delivered before the stream ended.
    pub items: Vec<T>,
    /// The fetch failure that cut the stream short, if any.
    pub error: Option<E>,
}

impl<T, E> Collected<T, E> {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Drain a paginated stream, keeping the partial result on failure.
pub async fn collect_all<T, E, S>(stream: S) -> Collected<T, E>
where
    S: Stream<Item = Result<T, E>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(item) => items.push(item),
            Err(e) => return Collected {
                items,
                error: Some(e),
            },
        }
    }
    Collected { items, error: None }
}
