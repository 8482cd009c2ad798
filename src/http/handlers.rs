use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use super::{Request, Response};

pub type TerminalFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;
pub type TerminalFn = Arc<dyn Fn(Request) -> TerminalFuture + Send + Sync>;

/// Upload handlers receive the decoded body incrementally. They return
/// `None` while more data is expected and the final response once invoked
/// with `is_complete = true`.
pub type UploadFuture = Pin<Box<dyn Future<Output = Result<Option<Response>>> + Send>>;
pub type UploadFn = Arc<dyn Fn(Request, Bytes, bool) -> UploadFuture + Send + Sync>;

/// The two handler shapes. Dispatch matches on the variant; there is no
/// downcasting involved.
#[derive(Clone)]
pub enum HandlerAction {
    Terminal(TerminalFn),
    Upload(UploadFn),
}

/// A URI prefix bound to a handler. Immutable once registered.
#[derive(Clone)]
pub struct UriHandler {
    prefix: String,
    action: HandlerAction,
}

impl UriHandler {
    pub fn terminal<F, Fut>(prefix: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        Self {
            prefix: prefix.into(),
            action: HandlerAction::Terminal(Arc::new(move |request| Box::pin(handler(request)))),
        }
    }

    pub fn upload<F, Fut>(prefix: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request, Bytes, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Response>>> + Send + 'static,
    {
        Self {
            prefix: prefix.into(),
            action: HandlerAction::Upload(Arc::new(move |request, data, is_complete| {
                Box::pin(handler(request, data, is_complete))
            })),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn action(&self) -> &HandlerAction {
        &self.action
    }

    /// Literal byte-prefix comparison: `/foo` matches `/foobar`. Path
    /// segments are deliberately not considered.
    pub fn matches(&self, uri: &str) -> bool {
        uri.starts_with(&self.prefix)
    }
}

/// An insertion-ordered handler registry. Registration order is significant:
/// dispatch returns the first registered handler whose prefix matches, even
/// when a later handler has a longer matching prefix.
#[derive(Clone, Default)]
pub struct UriHandlers {
    handlers: Vec<UriHandler>,
}

impl UriHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler. Duplicate or overlapping prefixes are allowed; the
    /// earlier registration shadows the later one.
    pub fn add(&mut self, handler: UriHandler) {
        self.handlers.push(handler);
    }

    pub fn handler_for(&self, uri: &str) -> Option<&UriHandler> {
        self.handlers.iter().find(|handler| handler.matches(uri))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};

    fn ok_handler(name: &'static str) -> UriHandler {
        UriHandler::terminal(name, |_request| async {
            Ok(Response::text(StatusCode::OK, "ok"))
        })
    }

    #[test]
    fn no_handlers_yields_none() {
        let handlers = UriHandlers::new();
        assert!(handlers.handler_for("/anything").is_none());
    }

    #[test]
    fn first_registered_prefix_wins_over_longer_match() {
        let mut handlers = UriHandlers::new();
        handlers.add(ok_handler("/foo"));
        handlers.add(ok_handler("/foo/bar"));

        let selected = handlers.handler_for("/foo/bar").unwrap();
        assert_eq!(selected.prefix(), "/foo");
    }

    #[test]
    fn registration_order_controls_shadowing() {
        let mut handlers = UriHandlers::new();
        handlers.add(ok_handler("/foo/bar"));
        handlers.add(ok_handler("/foo"));

        assert_eq!(
            handlers.handler_for("/foo/bar").unwrap().prefix(),
            "/foo/bar"
        );
        assert_eq!(handlers.handler_for("/foo/baz").unwrap().prefix(), "/foo");
    }

    #[test]
    fn prefix_match_is_byte_wise_not_segment_wise() {
        let mut handlers = UriHandlers::new();
        handlers.add(ok_handler("/foo"));
        assert!(handlers.handler_for("/foobar").is_some());
        assert!(handlers.handler_for("/fo").is_none());
    }

    #[test]
    fn duplicate_prefixes_are_kept_and_first_wins() {
        let mut handlers = UriHandlers::new();
        handlers.add(ok_handler("/a"));
        handlers.add(ok_handler("/a"));
        assert_eq!(handlers.len(), 2);
        assert!(handlers.handler_for("/a").is_some());
    }

    #[tokio::test]
    async fn dispatch_distinguishes_handler_shapes() {
        let mut handlers = UriHandlers::new();
        handlers.add(UriHandler::upload(
            "/upload",
            |_request, data, is_complete| async move {
                if is_complete {
                    Ok(Some(Response::text(
                        StatusCode::OK,
                        format!("got {} bytes", data.len()),
                    )))
                } else {
                    Ok(None)
                }
            },
        ));
        handlers.add(ok_handler("/"));

        let request = Request::new(Method::POST, "/upload/file");
        match handlers.handler_for(&request.uri).unwrap().action() {
            HandlerAction::Upload(handler) => {
                let pending = handler(request.clone(), Bytes::from_static(b"abc"), false)
                    .await
                    .unwrap();
                assert!(pending.is_none());
                let done = handler(request, Bytes::from_static(b"abc"), true)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(done.status, StatusCode::OK);
            }
            HandlerAction::Terminal(_) => panic!("expected the upload variant"),
        }

        match handlers.handler_for("/other").unwrap().action() {
            HandlerAction::Terminal(handler) => {
                let response = handler(Request::new(Method::GET, "/other")).await.unwrap();
                assert_eq!(response.status, StatusCode::OK);
            }
            HandlerAction::Upload(_) => panic!("expected the terminal variant"),
        }
    }
}
