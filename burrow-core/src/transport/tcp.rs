//! Plain TCP transport

use super::socket_tuning::configure_socket_silent;
use super::BoxedStream;
use std::io;
use tokio::net::TcpStream;

pub async fn connect(addr: &str) -> io::Result<BoxedStream> {
    let stream = TcpStream::connect(addr).await?;
    configure_socket_silent(&stream);
    Ok(Box::pin(stream))
}
