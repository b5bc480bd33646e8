//! Caller-side pagination.
//!
//! The dispatcher returns one page per call. Callers loop with
//! [`collect_pages`], feeding the previous page's token back in. The loop
//! stops as soon as either the token is empty or a page comes back empty.

use crate::dispatcher::{ApiCall, Dispatcher};
use crate::error::AwsResult;
use crate::transport::CallContext;
use serde_json::Value;
use std::future::Future;

/// Names of the paging fields of one API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginator {
    /// Request parameter that carries the token.
    pub input_token: &'static str,
    /// Result field that holds the next token.
    pub output_token: &'static str,
    /// Request parameter that bounds the page size, if any.
    pub limit_token: Option<&'static str>,
    /// Result field holding the page's items.
    pub items: &'static str,
}

impl Paginator {
    /// `NextToken` / `MaxResults` style used by the JSON services.
    pub const fn next_token(items: &'static str) -> Self {
        Self {
            input_token: "NextToken",
            output_token: "NextToken",
            limit_token: Some("MaxResults"),
            items,
        }
    }

    /// EC2 query style: lowercase `nextToken` in the result.
    pub const fn ec2(items: &'static str) -> Self {
        Self {
            input_token: "NextToken",
            output_token: "nextToken",
            limit_token: Some("MaxResults"),
            items,
        }
    }

    /// `Marker` / `IsTruncated` style used by IAM.
    pub const fn marker(items: &'static str) -> Self {
        Self {
            input_token: "Marker",
            output_token: "Marker",
            limit_token: Some("MaxItems"),
            items,
        }
    }
}

/// One page of results.
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// Accumulate pages until the token is empty or a page has no items.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> AwsResult<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = AwsResult<Page<T>>>,
{
    let mut all_items = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = fetch(token.take()).await?;
        if page.items.is_empty() {
            break;
        }
        all_items.extend(page.items);
        match page.next_token.filter(|t| !t.is_empty()) {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(all_items)
}

impl Dispatcher {
    /// Run `call` page by page with `paginator` and collect the raw items.
    pub async fn paginate(
        &self,
        ctx: &CallContext,
        call: &ApiCall,
        paginator: Paginator,
        page_size: Option<i64>,
    ) -> AwsResult<Vec<Value>> {
        collect_pages(|token| async move {
            let mut call = call.clone();
            if let Some(token) = token {
                call.params.insert(paginator.input_token, token);
            }
            if let (Some(limit), Some(size)) = (paginator.limit_token, page_size) {
                call.params.insert(limit, size);
            }
            let value = self.invoke_value(ctx, &call).await?;
            let items = match value.get(paginator.items) {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => vec![other.clone()],
            };
            let next_token = value
                .get(paginator.output_token)
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Ok(Page { items, next_token })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pages() -> Vec<(Vec<u32>, Option<&'static str>)> {
        vec![(vec![1, 2], Some("t1")), (vec![3], Some("t2")), (vec![4], None)]
    }

    #[tokio::test]
    async fn follows_tokens_until_empty() {
        let calls = AtomicUsize::new(0);
        let script = pages();
        let items = collect_pages(|token| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let (items, next) = script[n].clone();
            let expected = if n == 0 { None } else { script[n - 1].1 };
            async move {
                assert_eq!(token.as_deref(), expected);
                Ok(Page {
                    items,
                    next_token: next.map(str::to_string),
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_page_stops_even_with_token() {
        let calls = AtomicUsize::new(0);
        let items: Vec<u32> = collect_pages(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(Page {
                    items: Vec::new(),
                    next_token: Some("more".to_string()),
                })
            }
        })
        .await
        .unwrap();
        assert!(items.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_token_stops_even_with_items() {
        let calls = AtomicUsize::new(0);
        let items = collect_pages(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(Page {
                    items: vec!["a"],
                    next_token: Some(String::new()),
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(items, vec!["a"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
