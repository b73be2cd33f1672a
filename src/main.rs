use reqecho::echo_app;
use reqecho::echo_server::EchoServer;
use reqecho::Router;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let configuration = echo_app::parse_command_line().await?;
    let router = Router::from_configuration(&configuration);
    let server = EchoServer::new(&configuration, router);
    server.serve().await
}
