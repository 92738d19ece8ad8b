use std::sync::Arc;

use qos_client::{ClientIo, QosClient};
use qos_core::{Time, TokioTime};
use qos_rpc::ProcessedResults;
use qos_tokio_network::{GrpcTransport, TokioResolver, TokioSockets};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::args::run::RunArgs;

pub async fn run(args: RunArgs, verbosity: i32) -> anyhow::Result<()> {
    let time = Arc::new(TokioTime::new()) as Arc<dyn Time>;
    let io = ClientIo {
        time: Arc::clone(&time),
        sockets: Arc::new(TokioSockets::new(Arc::clone(&time))?),
        resolver: Arc::new(TokioResolver::new()?),
        transport: Box::new(GrpcTransport::new()?),
    };

    let (reports_tx, mut reports) = mpsc::unbounded_channel::<ProcessedResults>();
    let client = QosClient::new(
        args.client_config(verbosity),
        io,
        Box::new(move |results: &ProcessedResults| {
            let _ = reports_tx.send(results.clone());
        }),
    );

    info!(coordinator = %args.coordinator, port = args.port, profile = %args.profile, "starting");
    client.start(&args.coordinator, args.port, &args.profile).await;

    let mut updates = tokio::time::interval(args.update_interval());
    updates.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut remaining = args.cycles.max(1);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = updates.tick() => {
                client.update();
            }
            Some(results) = reports.recv() => {
                println!("{}", serde_json::to_string_pretty(&results)?);

                if results.hresult.is_error() {
                    warn!(hresult = ?results.hresult, "cycle failed");
                }

                remaining -= 1;
                if remaining == 0 {
                    break;
                }

                // a coordinator asking for a pause restarts the client itself
                if results.time_till_retry.is_zero() {
                    client.start(&args.coordinator, args.port, &args.profile).await;
                } else {
                    info!(retry_in = ?results.time_till_retry, "waiting for the next cycle");
                }
            }
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
        }
    }

    client.destroy().await;
    Ok(())
}
