// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Typed, lazy views over materialized query rows

use crate::error::{OrmError, Result};
use crate::value::Tuple;
use futures::Stream;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Policy for reducing a sequence result to one value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAccessMethod {
    /// The whole sequence; not a scalar access
    All,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
}

impl fmt::Display for ResultAccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Forward-only cursor over the raw rows of one query task
#[derive(Debug, Clone)]
pub struct RecordSetReader {
    rows: Arc<[Tuple]>,
    position: usize,
}

impl RecordSetReader {
    #[must_use]
    pub fn new(rows: Arc<[Tuple]>) -> Self {
        Self { rows, position: 0 }
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rewind to the first row
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for RecordSetReader {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        let row = self.rows.get(self.position)?.clone();
        self.position += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.rows.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

/// Registration of an open reader with its session
///
/// Released on drop; the session counts outstanding leases.
#[derive(Debug)]
pub struct ReaderLease {
    active: Arc<AtomicUsize>,
}

impl ReaderLease {
    pub(crate) fn acquire(active: Arc<AtomicUsize>) -> Self {
        _ = active.fetch_add(1, Ordering::AcqRel);
        Self { active }
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        _ = self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lazy, single-pass sequence of materialized items
pub struct QueryResult<T> {
    items: Box<dyn Iterator<Item = Result<T>> + Send>,
    buffered: bool,
    lease: Option<ReaderLease>,
}

impl<T: Send + 'static> QueryResult<T> {
    /// Items produced by mapping each row of `reader` on demand
    pub fn from_reader<F>(reader: RecordSetReader, mut map: F) -> Self
    where
        F: FnMut(&Tuple) -> Result<T> + Send + 'static,
    {
        Self {
            items: Box::new(reader.map(move |row| map(&row))),
            buffered: false,
            lease: None,
        }
    }

    /// Items already materialized into memory
    #[must_use]
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            items: Box::new(items.into_iter().map(Ok)),
            buffered: true,
            lease: None,
        }
    }

    /// Drain the items into a vector, stopping at the first error
    pub fn into_vec(self) -> Result<Vec<T>> {
        self.collect()
    }

    /// Reduce the sequence according to `method`
    ///
    /// `Ok(None)` is only returned by the `...OrDefault` methods.
    pub fn to_scalar(mut self, method: ResultAccessMethod) -> Result<Option<T>> {
        match method {
            ResultAccessMethod::All => Err(OrmError::NotScalar(method)),
            ResultAccessMethod::First => match self.next() {
                Some(item) => item.map(Some),
                None => Err(OrmError::Cardinality {
                    method,
                    expectation: "at least one element",
                    found: "is empty",
                }),
            },
            ResultAccessMethod::FirstOrDefault => self.next().transpose(),
            ResultAccessMethod::Single | ResultAccessMethod::SingleOrDefault => {
                let Some(first) = self.next().transpose()? else {
                    return if method == ResultAccessMethod::Single {
                        Err(OrmError::Cardinality {
                            method,
                            expectation: "exactly one element",
                            found: "is empty",
                        })
                    } else {
                        Ok(None)
                    };
                };
                if self.next().is_some() {
                    return Err(OrmError::Cardinality {
                        method,
                        expectation: "at most one element",
                        found: "has more than one element",
                    });
                }
                Ok(Some(first))
            }
        }
    }
}

impl<T> QueryResult<T> {
    pub(crate) fn with_lease(mut self, lease: ReaderLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Whether the items live in memory rather than behind a reader
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }
}

impl<T> Iterator for QueryResult<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        let item = self.items.next();
        if item.is_none() {
            self.lease = None;
        }
        item
    }
}

impl<T> fmt::Debug for QueryResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("buffered", &self.buffered)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

/// A pending [`QueryResult`] consumed asynchronously
pub struct AsyncQueryResult<T> {
    pending: BoxFuture<'static, Result<QueryResult<T>>>,
}

impl<T: Send + 'static> AsyncQueryResult<T> {
    pub fn new<F>(pending: F) -> Self
    where
        F: Future<Output = Result<QueryResult<T>>> + Send + 'static,
    {
        Self {
            pending: Box::pin(pending),
        }
    }

    /// Await the inner result
    pub async fn into_result(self) -> Result<QueryResult<T>> {
        self.pending.await
    }

    /// Stream the items, awaiting the inner result once
    ///
    /// Cancellation is observed before awaiting and before every item. The
    /// inner result (and its reader lease) is dropped together with the
    /// stream, so partial consumption releases the reader.
    pub fn into_stream(self, cancel: CancellationToken) -> impl Stream<Item = Result<T>> + Send {
        let pending = self.pending;
        async_stream::try_stream! {
            if cancel.is_cancelled() {
                Err::<(), _>(OrmError::Cancelled)?;
            }
            let result = pending.await?;
            for item in result {
                if cancel.is_cancelled() {
                    Err::<(), _>(OrmError::Cancelled)?;
                }
                yield item?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FromValue, Value};
    use futures::StreamExt;

    fn ints(values: &[i64]) -> QueryResult<i64> {
        let rows: Vec<Tuple> = values.iter().map(|v| vec![Value::Int(*v)]).collect();
        QueryResult::from_reader(RecordSetReader::new(Arc::from(rows)), |row| {
            i64::from_value(&row[0])
        })
    }

    #[test]
    fn test_first() {
        assert!(matches!(
            ints(&[]).to_scalar(ResultAccessMethod::First),
            Err(OrmError::Cardinality { .. })
        ));
        assert_eq!(ints(&[4]).to_scalar(ResultAccessMethod::First).expect("one"), Some(4));
        assert_eq!(
            ints(&[4, 5, 6]).to_scalar(ResultAccessMethod::First).expect("many"),
            Some(4)
        );
    }

    #[test]
    fn test_first_or_default() {
        assert_eq!(
            ints(&[]).to_scalar(ResultAccessMethod::FirstOrDefault).expect("empty"),
            None
        );
        assert_eq!(
            ints(&[8, 9]).to_scalar(ResultAccessMethod::FirstOrDefault).expect("many"),
            Some(8)
        );
    }

    #[test]
    fn test_single() {
        assert_eq!(ints(&[1]).to_scalar(ResultAccessMethod::Single).expect("one"), Some(1));
        assert!(ints(&[]).to_scalar(ResultAccessMethod::Single).is_err());
        assert!(ints(&[1, 2]).to_scalar(ResultAccessMethod::Single).is_err());
    }

    #[test]
    fn test_single_or_default() {
        assert_eq!(
            ints(&[]).to_scalar(ResultAccessMethod::SingleOrDefault).expect("empty"),
            None
        );
        assert_eq!(
            ints(&[3]).to_scalar(ResultAccessMethod::SingleOrDefault).expect("one"),
            Some(3)
        );
        assert!(matches!(
            ints(&[1, 2]).to_scalar(ResultAccessMethod::SingleOrDefault),
            Err(OrmError::Cardinality { found: "has more than one element", .. })
        ));
    }

    #[test]
    fn test_all_is_not_scalar() {
        assert!(matches!(
            ints(&[1]).to_scalar(ResultAccessMethod::All),
            Err(OrmError::NotScalar(ResultAccessMethod::All))
        ));
    }

    #[test]
    fn test_reader_restart() {
        let rows: Vec<Tuple> = vec![vec![Value::Int(1)], vec![Value::Int(2)]];
        let mut reader = RecordSetReader::new(Arc::from(rows));
        assert_eq!(reader.by_ref().count(), 2);
        assert_eq!(reader.next(), None);
        reader.restart();
        assert_eq!(reader.row_count(), 2);
        assert_eq!(reader.next(), Some(vec![Value::Int(1)]));
    }

    #[test]
    fn test_lease_released_on_exhaustion_and_drop() {
        let active = Arc::new(AtomicUsize::new(0));

        let mut result = ints(&[1, 2]).with_lease(ReaderLease::acquire(active.clone()));
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert!(result.next().is_some());
        drop(result);
        assert_eq!(active.load(Ordering::SeqCst), 0);

        let result = ints(&[1]).with_lease(ReaderLease::acquire(active.clone()));
        assert_eq!(result.into_vec().expect("items"), vec![1]);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_async_stream_cancellation() {
        let cancel = CancellationToken::new();
        let pending = AsyncQueryResult::new(async { Ok(ints(&[1, 2, 3])) });
        let mut stream = Box::pin(pending.into_stream(cancel.clone()));

        assert_eq!(stream.next().await.expect("item").expect("ok"), 1);
        cancel.cancel();
        assert!(matches!(stream.next().await, Some(Err(OrmError::Cancelled))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_async_into_result() {
        let pending = AsyncQueryResult::new(async { Ok(QueryResult::from_vec(vec![7, 8])) });
        let result = pending.into_result().await.expect("result");
        assert!(result.is_buffered());
        assert_eq!(result.into_vec().expect("items"), vec![7, 8]);
    }
}
