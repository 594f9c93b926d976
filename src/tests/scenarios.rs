use crate::config::{parse_file, ConfigProvider};
use crate::dispatch::registry::{FactoryRegistry, PreParseHooks, WsgiFactory};
use crate::dispatch::{WsgiHandler, WsgiContext, WsgiResponse};
use crate::plan::{LaunchPlan, SubInstance};
use crate::stats::{Aggregator, StatsRegion};
use std::sync::Arc;

struct CountingFactory;
impl PreParseHooks for CountingFactory {}
impl WsgiFactory for CountingFactory {
    fn build(
        &self,
        name: &str,
        _parsed_conf: &serde_json::Value,
        next: Arc<dyn WsgiHandler>,
    ) -> Arc<dyn WsgiHandler> {
        struct Link(String, Arc<dyn WsgiHandler>);
        impl WsgiHandler for Link {
            fn name(&self) -> &str {
                &self.0
            }
            fn handle(&self, ctx: &mut WsgiContext) -> WsgiResponse {
                if ctx.request.path == "/app" {
                    WsgiResponse {
                        status: 200,
                        headers: vec![],
                        body: vec![],
                    }
                } else {
                    self.1.handle(ctx)
                }
            }
        }
        Arc::new(Link(name.to_string(), next))
    }
}

fn registry_with_counting_app() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry.register_wsgi("scenario.counting", Arc::new(CountingFactory));
    registry
}

/// §8 boundary scenario: a multi-worker wsgi sub-instance, plus a second
/// listener in the same family, and a daemon; the plan should end up
/// with one StatsRegion big enough for all of their declared slots and
/// the aggregator should fold request counts across workers.
#[test]
fn full_plan_build_and_stats_rollup() {
    let content = "\
[brim]
count_status_codes = 404 500

[wsgi]
port = 8901
workers = 3
apps = app

[app]
call = scenario.counting

[daemons]
daemons = beat

[beat]
call = scenario.counting
";
    // Reuse the wsgi factory for the daemon slot too would fail type
    // checking; give the daemon its own trivial stand-in instead.
    let content = content.replace("[beat]\ncall = scenario.counting", "[beat]\ncall = scenario.noop");

    struct NoopDaemonFactory;
    impl PreParseHooks for NoopDaemonFactory {}
    impl crate::dispatch::registry::DaemonFactory for NoopDaemonFactory {
        fn build(&self, _name: &str, _c: &serde_json::Value) -> Arc<dyn crate::dispatch::Daemon> {
            struct D;
            impl crate::dispatch::Daemon for D {
                fn run(
                    &self,
                    _s: &crate::dispatch::SubInstanceHandle,
                    _st: &crate::stats::StatsHandle,
                    _sh: &crate::dispatch::ShutdownFlag,
                ) {
                }
            }
            Arc::new(D)
        }
    }

    let mut registry = registry_with_counting_app();
    registry.register_daemon("scenario.noop", Arc::new(NoopDaemonFactory));

    let cfg = ConfigProvider::new(parse_file(&content).unwrap());
    let plan = LaunchPlan::build(&cfg, &registry).unwrap();

    let SubInstance::Wsgi(wsgi) = &plan.sub_instances[0] else {
        panic!("expected a wsgi sub-instance");
    };
    assert_eq!(wsgi.common.worker_count, 3);

    let mut slot_keys = Vec::new();
    for sub in &plan.sub_instances {
        for scope in sub.worker_scopes() {
            for decl in sub.declared_stats() {
                slot_keys.push((scope.clone(), decl.name));
            }
        }
    }
    for daemon in &plan.daemons {
        for decl in daemon.declared_stats() {
            slot_keys.push((daemon.scope(), decl.name));
        }
    }
    let region = Arc::new(StatsRegion::allocate(&slot_keys).unwrap());

    let scopes = wsgi.worker_scopes();
    assert_eq!(scopes.len(), 3);
    for scope in &scopes {
        region.handle_for_scope(scope.clone()).incr("request_count");
    }
    region.handle_for_scope(scopes[1].clone()).incr("request_count");

    let agg = Aggregator::new(&region);
    let result = agg.aggregate(&scopes, &wsgi.declared_stats());
    assert_eq!(result["request_count"], 4);
    assert_eq!(result["1"]["request_count"], 2);

    // status_404_count / status_500_count were added by [brim]'s
    // count_status_codes override, not the wsgi section's own.
    let names: Vec<String> = wsgi.declared_stats().into_iter().map(|d| d.name).collect();
    assert!(names.contains(&"status_404_count".to_string()));
    assert!(names.contains(&"status_500_count".to_string()));
}

/// Section-family fallback (§6) combined with plan building: an
/// override in `[wsgi#admin]` shadows the family default, while an
/// unset option still falls all the way back to `[brim]`.
#[test]
fn family_fallback_feeds_plan_construction() {
    let content = "\
[brim]
user = www

[wsgi]
port = 8901
apps = app
workers = 2

[wsgi#admin]
port = 8902
workers = 1

[app]
call = scenario.counting
";
    let cfg = ConfigProvider::new(parse_file(content).unwrap());
    let registry = registry_with_counting_app();
    let plan = LaunchPlan::build(&cfg, &registry).unwrap();

    assert_eq!(plan.sub_instances.len(), 2);
    let admin = plan
        .sub_instances
        .iter()
        .find(|s| s.common().name == "wsgi#admin")
        .unwrap();
    assert_eq!(admin.common().worker_count, 1);
    // apps falls back to the family section's `apps = app`.
    let SubInstance::Wsgi(admin_wsgi) = admin else {
        panic!("expected wsgi");
    };
    assert_eq!(admin_wsgi.handlers.len(), 1);
    assert_eq!(admin_wsgi.handlers[0].name, "app");
    assert_eq!(plan.identity.user.as_deref(), Some("www"));
}

/// §4.2: the restart backoff sequence in isolation, confirming it
/// matches the 1s/2s/4s.../60s-cap/reset-after-60s-uptime invariant the
/// supervisor relies on when reforking a crashed worker.
#[test]
fn restart_backoff_matches_documented_schedule() {
    use crate::supervisor::RestartBackoff;
    use std::time::Duration;

    let mut backoff = RestartBackoff::new();
    let delays: Vec<Duration> = (0..7)
        .map(|_| backoff.next_delay(Duration::from_secs(0)))
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(16),
            Duration::from_secs(32),
            Duration::from_secs(60),
        ]
    );

    // A long uptime resets the schedule back to the initial delay.
    let next = backoff.next_delay(Duration::from_secs(61));
    assert_eq!(next, Duration::from_secs(1));
}
