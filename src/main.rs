use nioway::{Config, Request, Response, Server};

/// Answers `/echo` with the request entity and everything else with a
/// greeting.
fn handle(request: Request) -> Response {
    match request.target.as_str() {
        "/echo" => match request.entity.into_bytes() {
            Ok(body) => Response::ok(body),
            Err(e) => {
                tracing::warn!(error = %e, "Unable to read request entity");
                Response::internal_error()
            }
        },
        "/" | "/hello" => Response::ok("Hello from nioway\n")
            .header("Content-Type", "text/plain"),
        _ => Response::not_found(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let mut server = Server::start(&cfg, handle)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.stop()?;

    Ok(())
}
