//! Offset-driven page loop over a [`RecordSource`].

use byd_adapters::{RecordQuery, RecordSource, SourceError};
use byd_core::RawEntry;
use tracing::{debug, info, warn};

/// Everything one extraction returned, pages concatenated in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub entries: Vec<RawEntry>,
    pub pages: usize,
}

pub struct PaginatedFetcher<'a> {
    source: &'a dyn RecordSource,
}

impl<'a> PaginatedFetcher<'a> {
    pub fn new(source: &'a dyn RecordSource) -> Self {
        Self { source }
    }

    /// Request pages until one comes back empty or short. Transport errors abort
    /// the whole extraction; a parse error after a good page ends it.
    pub async fn fetch(&self, query: &RecordQuery) -> Result<Extraction, SourceError> {
        let page_size = query.page_size;
        let mut extraction = Extraction::default();
        let mut offset = query.offset;

        loop {
            let page_no = extraction.pages + 1;
            debug!(dataset_id = %query.dataset_id, page_no, offset, "requesting page");

            let page = match self.source.fetch_page(&query.at_offset(offset)).await {
                Ok(page) => page,
                Err(err) if err.is_parse() && extraction.pages > 0 => {
                    warn!(
                        dataset_id = %query.dataset_id,
                        page_no,
                        offset,
                        error = %err,
                        "undecodable page after successful pages; treating as end of data"
                    );
                    break;
                }
                Err(err) => return Err(err),
            };
            extraction.pages += 1;

            let rows = page.len();
            if rows == 0 {
                debug!(dataset_id = %query.dataset_id, page_no, "empty page; end of data");
                break;
            }
            info!(dataset_id = %query.dataset_id, page_no, rows, "page received");
            extraction.entries.extend(page);

            if page_size == 0 || rows < page_size {
                break;
            }
            offset += page_size;
        }

        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use byd_adapters::Filter;
    use byd_storage::FetchError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Pages {
        script: Mutex<VecDeque<Result<Vec<RawEntry>, SourceError>>>,
        offsets: Mutex<Vec<usize>>,
    }

    impl Pages {
        fn new(script: Vec<Result<Vec<RawEntry>, SourceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                offsets: Mutex::new(Vec::new()),
            }
        }

        fn offsets(&self) -> Vec<usize> {
            self.offsets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordSource for Pages {
        async fn fetch_page(&self, query: &RecordQuery) -> Result<Vec<RawEntry>, SourceError> {
            self.offsets.lock().unwrap().push(query.offset);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn entries(n: usize) -> Vec<RawEntry> {
        (0..n)
            .map(|i| [("CCINHUUID".to_string(), i.to_string())].into_iter().collect())
            .collect()
    }

    fn query(page_size: usize) -> RecordQuery {
        RecordQuery {
            dataset_id: "sales".into(),
            entity_set: "Q".into(),
            select: vec!["CCINHUUID".into()],
            filter: Filter::default(),
            page_size,
            offset: 0,
        }
    }

    #[tokio::test]
    async fn short_page_ends_extraction_after_exactly_k_requests() {
        let source = Pages::new(vec![Ok(entries(2)), Ok(entries(2)), Ok(entries(1)), Ok(entries(2))]);
        let extraction = PaginatedFetcher::new(&source).fetch(&query(2)).await.unwrap();

        assert_eq!(extraction.pages, 3);
        assert_eq!(extraction.entries.len(), 5);
        assert_eq!(source.offsets(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn empty_page_ends_extraction() {
        let source = Pages::new(vec![Ok(entries(2)), Ok(Vec::new())]);
        let extraction = PaginatedFetcher::new(&source).fetch(&query(2)).await.unwrap();
        assert_eq!(extraction.pages, 2);
        assert_eq!(extraction.entries.len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_discards_earlier_pages() {
        let source = Pages::new(vec![
            Ok(entries(2)),
            Err(SourceError::Transport(FetchError::HttpStatus {
                status: 503,
                url: "https://host/svc/Q".into(),
            })),
        ]);
        let err = PaginatedFetcher::new(&source).fetch(&query(2)).await.unwrap_err();
        assert!(!err.is_parse());
    }

    #[tokio::test]
    async fn parse_failure_is_fatal_only_on_the_first_page() {
        let first = Pages::new(vec![Err(SourceError::Parse("bad".into()))]);
        assert!(PaginatedFetcher::new(&first).fetch(&query(2)).await.is_err());

        let later = Pages::new(vec![Ok(entries(2)), Err(SourceError::Parse("bad".into()))]);
        let extraction = PaginatedFetcher::new(&later).fetch(&query(2)).await.unwrap();
        assert_eq!(extraction.entries.len(), 2);
        assert_eq!(extraction.pages, 1);
    }
}
