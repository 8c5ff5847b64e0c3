use std::net::SocketAddr;

use udp_server::{InternetProtocol, Service, UdpServer, UdpServerHandler};

struct Echo;

impl UdpServerHandler for Echo {
    fn on_started(&mut self, server: &UdpServer) {
        println!("Echo server started on {:?}", server.local_endpoint());
        // Arm the first receive; every further one is re-armed from on_received
        server.receive();
    }

    fn on_stopped(&mut self, _server: &UdpServer) {
        println!("Echo server stopped");
    }

    fn on_received(&mut self, server: &UdpServer, peer: SocketAddr, data: &[u8]) {
        println!("Received {} bytes from {}", data.len(), peer);
        if !server.send_async(peer, data) {
            eprintln!("Failed to queue echo response for {}", peer);
        }
        server.receive();
    }

    fn on_sent(&mut self, _server: &UdpServer, destination: SocketAddr, sent: usize) {
        println!("Sent {} bytes back to {}", sent, destination);
    }

    fn on_error(&mut self, code: i32, category: &'static str, message: &str) {
        eprintln!("Error {} ({}): {}", code, category, message);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service = Service::from_current()?;
    let server = UdpServer::new(&service, Echo, InternetProtocol::IPv4, 3333);

    server.start();
    println!("UDP echo server listening on port 3333, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}
