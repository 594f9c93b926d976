//! `demos.echo`: a WSGI link that answers `GET /echo` with the request
//! body, and forwards everything else down the chain.

use crate::dispatch::registry::{PreParseHooks, WsgiFactory};
use crate::dispatch::{WsgiContext, WsgiHandler, WsgiResponse};
use std::sync::Arc;

pub struct EchoFactory;
impl PreParseHooks for EchoFactory {}
impl WsgiFactory for EchoFactory {
    fn build(
        &self,
        name: &str,
        _parsed_conf: &serde_json::Value,
        next_in_chain: Arc<dyn WsgiHandler>,
    ) -> Arc<dyn WsgiHandler> {
        Arc::new(EchoLink {
            name: name.to_string(),
            next: next_in_chain,
        })
    }
}

struct EchoLink {
    name: String,
    next: Arc<dyn WsgiHandler>,
}

impl WsgiHandler for EchoLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, ctx: &mut WsgiContext) -> WsgiResponse {
        if ctx.request.path == "/echo" {
            WsgiResponse {
                status: 200,
                headers: vec![("content-type".into(), "text/plain".into())],
                body: ctx.request.body.clone(),
            }
        } else {
            self.next.handle(ctx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::chain::{sub_instance_handle, NotFoundLink};
    use crate::dispatch::{RequestId, SerdeJsonCodec, WsgiRequest};
    use crate::stats::StatsRegion;

    #[test]
    fn matches_get_echo_and_falls_through_otherwise() {
        let region = Arc::new(
            StatsRegion::allocate(&[("wsgi:a:0".into(), "request_count".into())]).unwrap(),
        );
        let link = EchoFactory.build("echo", &serde_json::Value::Null, Arc::new(NotFoundLink));
        let mut ctx = WsgiContext {
            sub_instance: sub_instance_handle("a", 0),
            request: WsgiRequest {
                method: "GET".into(),
                path: "/echo".into(),
                headers: vec![],
                body: b"hello".to_vec(),
                peer: "127.0.0.1:1".parse().unwrap(),
            },
            start: std::time::Instant::now(),
            request_id: RequestId::generate(),
            extra_log_tokens: vec![],
            stats: region.handle_for_scope("wsgi:a:0"),
            json_codec: Arc::new(SerdeJsonCodec),
        };
        let resp = link.handle(&mut ctx);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");

        ctx.request.path = "/nope".into();
        let resp = link.handle(&mut ctx);
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn matches_post_echo_with_the_request_body() {
        let region = Arc::new(
            StatsRegion::allocate(&[("wsgi:a:0".into(), "request_count".into())]).unwrap(),
        );
        let link = EchoFactory.build("echo", &serde_json::Value::Null, Arc::new(NotFoundLink));
        let mut ctx = WsgiContext {
            sub_instance: sub_instance_handle("a", 0),
            request: WsgiRequest {
                method: "POST".into(),
                path: "/echo".into(),
                headers: vec![],
                body: b"Just a test.".to_vec(),
                peer: "127.0.0.1:1".parse().unwrap(),
            },
            start: std::time::Instant::now(),
            request_id: RequestId::generate(),
            extra_log_tokens: vec![],
            stats: region.handle_for_scope("wsgi:a:0"),
            json_codec: Arc::new(SerdeJsonCodec),
        };
        let resp = link.handle(&mut ctx);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"Just a test.");
    }
}
