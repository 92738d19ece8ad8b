use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use qos_core::{oneshot_result, Lookup, LookupStatus, OneshotResult, Resolver};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

/// Resolves site names with `tokio::net::lookup_host`.
#[derive(Debug, Clone)]
pub struct TokioResolver {
    runtime: Handle,
}

impl TokioResolver {
    pub fn new() -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("lookups need a tokio runtime")?;
        Ok(Self { runtime })
    }
}

impl Resolver for TokioResolver {
    #[tracing::instrument(skip(self))]
    fn lookup(&self, host: &str) -> anyhow::Result<Box<dyn Lookup>> {
        let (tx, result) = oneshot_result();
        let host = host.to_string();

        let task = self.runtime.spawn(
            async move {
                let _ = tx.send(resolve(&host).await);
            }
            .in_current_span(),
        );

        Ok(Box::new(TokioLookup {
            result,
            status: LookupStatus::Pending,
            task,
        }))
    }
}

async fn resolve(host: &str) -> anyhow::Result<IpAddr> {
    let ip = first_ipv4(tokio::net::lookup_host((host, 0)).await?)
        .with_context(|| format!("{host} has no ipv4 addresses"))?;

    debug!(host, %ip, "resolved");
    Ok(ip)
}

/// Probe sockets are bound to an IPv4 address, so only IPv4 sites can be
/// reached.
fn first_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<IpAddr> {
    addrs.into_iter().find(SocketAddr::is_ipv4).map(|addr| addr.ip())
}

struct TokioLookup {
    result: OneshotResult<IpAddr>,
    status: LookupStatus,
    task: JoinHandle<()>,
}

impl Lookup for TokioLookup {
    fn poll(&mut self) -> LookupStatus {
        if self.status == LookupStatus::Pending {
            self.status = match self.result.try_take() {
                None => LookupStatus::Pending,
                Some(Ok(ip)) => LookupStatus::Resolved(ip),
                Some(Err(e)) => {
                    debug!("lookup failed: {e:#}");
                    LookupStatus::Failed
                }
            };
        }

        self.status
    }
}

impl Drop for TokioLookup {
    fn drop(&mut self) {
        self.task.abort();
    }
}
