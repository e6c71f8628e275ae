use std::sync::Arc;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::anyhow;
use clap::Parser;
use kube::Client;
use rook_controllers::{
    cluster::controller as cluster,
    config::{OperatorArgs, OperatorConfig},
    disruption::controller as disruption,
    pool::controller as pool,
    telemetry::{state::State, telemetry},
};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = OperatorArgs::parse();
    telemetry::init(args.common.log_json).await?;
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let client = Client::try_default().await?;
    let state = State::new(OperatorConfig::from(&args));
    let ctx = state.to_context(client).await;
    info!("rook operator watching clusters, operator namespace {}", ctx.config.namespace);

    let cancel = state.shutdown_token();
    // in-flight reconciles block shutdown until their waits are cancelled
    let signals = {
        let state = state.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown requested");
            state.shutdown();
        })
    };
    let controllers = {
        let (ctx, state) = (ctx.clone(), state.clone());
        async move {
            tokio::join!(cluster::run(ctx.clone()), pool::run(ctx));
            state.shutdown();
        }
    };

    let data = Data::new(state.clone());
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .workers(5)
    .bind(&args.bind)?
    .shutdown_timeout(5);

    tokio::join!(
        controllers,
        cluster::run_health(ctx.clone(), cancel.clone()),
        disruption::run(Arc::clone(&ctx), cancel.clone()),
        server.run()
    )
    .3?;
    signals.abort();
    Ok(())
}

async fn shutdown_signal() {
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("failed to listen for SIGTERM: {e}");
            let _ = signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
