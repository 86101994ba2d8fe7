//! Full tunnel demo on loopback
//! Runs a mock upstream, the tunnel server, and the tunnel client in
//! one process, then resolves a name through the whole chain.

use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

use chapar::message::{self, Message, Name, Rr, CLASS_IN, RR_TYPE_A};
use chapar::{ClientConfig, ServerConfig, TunnelClient, TunnelServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("=== Chapar Tunnel Demo ===\n");

    let secret = vec![0x42u8; 32];

    // Mock upstream: answers every question with A 10.11.12.13
    let upstream_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let upstream_addr = upstream_socket.local_addr()?;
    println!("Starting mock upstream on {}", upstream_addr);

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, peer)) = upstream_socket.recv_from(&mut buf).await {
            let Ok(query) = Message::parse(&buf[..n]) else {
                continue;
            };
            println!(
                "[UPSTREAM] question: {} (id {:04x})",
                query.question[0].name, query.id
            );

            let mut resp = message::create_response(&query);
            resp.answer.push(Rr {
                name: query.question[0].name.clone(),
                rtype: RR_TYPE_A,
                class: CLASS_IN,
                ttl: 300,
                data: vec![10, 11, 12, 13],
            });
            if let Ok(bytes) = resp.marshal() {
                let _ = upstream_socket.send_to(&bytes, peer).await;
            }
        }
    });

    // Tunnel server, authoritative for t.example.com
    let mut server = TunnelServer::new(ServerConfig {
        listen_addr: "127.0.0.1:0".parse()?,
        domain: "t.example.com".to_string(),
        shared_secret: secret.clone(),
        upstream: upstream_addr.to_string(),
        ..Default::default()
    })?;
    server.start().await?;
    let server_addr = server.local_addr().expect("server bound");
    println!("Tunnel server on {}", server_addr);

    // Tunnel client, racing a single "recursive" (the server itself)
    let mut client = TunnelClient::new(ClientConfig {
        listen_addr: "127.0.0.1:0".parse()?,
        server_domain: "t.example.com".to_string(),
        resolvers: vec![server_addr.to_string()],
        shared_secret: secret,
        ..Default::default()
    })?;
    client.start().await?;
    let client_addr = client.local_addr().expect("client bound");
    println!("Tunnel client on {}\n", client_addr);

    // The "application": one plain DNS query against the client
    let app = UdpSocket::bind("127.0.0.1:0").await?;
    app.connect(client_addr).await?;

    let mut query = message::create_query(Name::parse("demo.example.com")?, RR_TYPE_A, 0x7a7a);
    query.add_edns0(4096);
    app.send(&query.marshal()?).await?;

    let mut buf = vec![0u8; 4096];
    match timeout(Duration::from_secs(5), app.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            let response = Message::parse(&buf[..n])?;
            println!(
                "[APP] response id {:04x}, rcode {}, answers {}",
                response.id,
                response.rcode(),
                response.answer.len()
            );
            for rr in &response.answer {
                println!("[APP] {} -> {:?}", rr.name, rr.data);
            }
            println!("\nTunnel exchange completed");
        }
        Ok(Err(e)) => println!("[APP] receive error: {}", e),
        Err(_) => println!("[APP] timeout waiting for response"),
    }

    client.stop().await;
    server.stop().await;
    Ok(())
}
