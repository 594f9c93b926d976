//! The WSGI handler chain: an ordered list of links terminated by a
//! built-in 404/status-accounting link (§4.5 "Default WSGI status
//! accounting").

use super::{SubInstanceHandle, WsgiContext, WsgiHandler, WsgiResponse};
use std::collections::HashSet;
use std::sync::Arc;

/// The built-in final link. Always matches; returns 404 and accounts the
/// standard status counters. Every chain is built with this as its tail.
pub struct NotFoundLink;

impl WsgiHandler for NotFoundLink {
    fn name(&self) -> &str {
        "__not_found__"
    }
    fn handle(&self, _ctx: &mut WsgiContext) -> WsgiResponse {
        WsgiResponse::not_found()
    }
}

/// Wraps the whole chain to observe the final status and increment the
/// standard counters (§4.5). `request_count` is incremented
/// unconditionally; `status_<class>_count` always; `status_<code>_count`
/// only for codes in the tracked set.
pub struct StatusAccountingChain {
    head: Arc<dyn WsgiHandler>,
    tracked_codes: HashSet<u16>,
}

impl StatusAccountingChain {
    #[must_use]
    pub fn new(head: Arc<dyn WsgiHandler>, tracked_codes: HashSet<u16>) -> Self {
        Self {
            head,
            tracked_codes,
        }
    }

    /// Build a chain from handler links in order, terminated by the
    /// built-in 404 link, then wrap it for status accounting.
    #[must_use]
    pub fn build(links: Vec<Arc<dyn WsgiHandler>>, tracked_codes: HashSet<u16>) -> Self {
        // Links are already composed with their `next_in_chain` at
        // construction time (see dispatch::registry::build_wsgi_chain),
        // so `head` is simply the first link; the tail is guaranteed to
        // be a NotFoundLink by that construction.
        let head: Arc<dyn WsgiHandler> = links
            .into_iter()
            .next()
            .unwrap_or_else(|| Arc::new(NotFoundLink));
        Self::new(head, tracked_codes)
    }

    pub fn dispatch(&self, ctx: &mut WsgiContext) -> WsgiResponse {
        ctx.stats.incr("request_count");
        let response = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.head.handle(ctx)
        }));
        let response = match response {
            Ok(r) => r,
            Err(_) => {
                log::error!(
                    "request {} on {}: handler panicked, returning 500",
                    ctx.request_id,
                    ctx.sub_instance.sub_instance_name
                );
                WsgiResponse::internal_error()
            }
        };
        self.account(ctx, response.status);
        response
    }

    fn account(&self, ctx: &WsgiContext, status: u16) {
        let class_name = match status / 100 {
            2 => "status_2xx_count",
            3 => "status_3xx_count",
            4 => "status_4xx_count",
            5 => "status_5xx_count",
            _ => return,
        };
        ctx.stats.incr(class_name);
        if self.tracked_codes.contains(&status) {
            ctx.stats.incr(&format!("status_{status}_count"));
        }
    }
}

/// Default tracked HTTP status codes (§3 entity LaunchPlan).
#[must_use]
pub fn default_tracked_status_codes() -> HashSet<u16> {
    [404u16, 408, 499, 501].into_iter().collect()
}

pub fn sub_instance_handle(sub_instance_name: &str, worker_index: usize) -> SubInstanceHandle {
    SubInstanceHandle {
        sub_instance_name: sub_instance_name.to_string(),
        worker_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{RequestId, SerdeJsonCodec, WsgiRequest};
    use crate::stats::StatsRegion;
    use std::sync::Arc;

    struct EchoLink;
    impl WsgiHandler for EchoLink {
        fn name(&self) -> &str {
            "echo"
        }
        fn handle(&self, ctx: &mut WsgiContext) -> WsgiResponse {
            if ctx.request.path == "/echo" {
                WsgiResponse {
                    status: 200,
                    headers: vec![],
                    body: ctx.request.body.clone(),
                }
            } else {
                WsgiResponse::not_found()
            }
        }
    }

    fn make_ctx(region: &Arc<StatsRegion>, path: &str) -> WsgiContext {
        WsgiContext {
            sub_instance: sub_instance_handle("wsgi", 0),
            request: WsgiRequest {
                method: "GET".into(),
                path: path.into(),
                headers: vec![],
                body: b"hi".to_vec(),
                peer: "127.0.0.1:1".parse().unwrap(),
            },
            start: std::time::Instant::now(),
            request_id: RequestId::generate(),
            extra_log_tokens: vec![],
            stats: region.handle_for_scope("wsgi:a:0"),
            json_codec: Arc::new(SerdeJsonCodec),
        }
    }

    #[test]
    fn matching_path_returns_200_and_increments_2xx() {
        let region = Arc::new(
            StatsRegion::allocate(&[
                ("wsgi:a:0".into(), "request_count".into()),
                ("wsgi:a:0".into(), "status_2xx_count".into()),
                ("wsgi:a:0".into(), "status_4xx_count".into()),
                ("wsgi:a:0".into(), "status_404_count".into()),
            ])
            .unwrap(),
        );
        let chain = StatusAccountingChain::build(
            vec![Arc::new(EchoLink), Arc::new(NotFoundLink)],
            default_tracked_status_codes(),
        );
        let mut ctx = make_ctx(&region, "/echo");
        let resp = chain.dispatch(&mut ctx);
        assert_eq!(resp.status, 200);
        assert_eq!(ctx.stats.get("request_count"), 1);
        assert_eq!(ctx.stats.get("status_2xx_count"), 1);
    }

    #[test]
    fn unmatched_path_falls_through_to_404() {
        let region = Arc::new(
            StatsRegion::allocate(&[
                ("wsgi:a:0".into(), "request_count".into()),
                ("wsgi:a:0".into(), "status_4xx_count".into()),
                ("wsgi:a:0".into(), "status_404_count".into()),
            ])
            .unwrap(),
        );
        let chain = StatusAccountingChain::build(
            vec![Arc::new(EchoLink), Arc::new(NotFoundLink)],
            default_tracked_status_codes(),
        );
        let mut ctx = make_ctx(&region, "/other");
        let resp = chain.dispatch(&mut ctx);
        assert_eq!(resp.status, 404);
        assert_eq!(ctx.stats.get("status_404_count"), 1);
    }
}
