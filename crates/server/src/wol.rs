use relay_protocol::{MacAddress, build_magic_packet};
use tokio::net::UdpSocket;

/// Broadcasts a Wake-on-LAN magic packet for `mac` to `broadcast_addr:port`
/// (§4.10). Errors surface as the underlying I/O error message; there is no
/// retry — the caller reports it straight through to the HTTP response.
pub async fn send_magic_packet(
    mac: &MacAddress,
    broadcast_addr: &str,
    port: u16,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let packet = build_magic_packet(mac);
    socket
        .send_to(&packet, (broadcast_addr, port))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_magic_packet_to_loopback_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = listener.local_addr().unwrap();

        let mac = MacAddress::parse("11:22:33:44:55:66").unwrap();
        send_magic_packet(&mac, "127.0.0.1", listener_addr.port())
            .await
            .unwrap();

        let mut buf = [0u8; 128];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 102);
        assert_eq!(&buf[..6], &[0xFF; 6]);
        assert_eq!(&buf[6..12], &mac.octets());
    }

    #[tokio::test]
    async fn rejects_unresolvable_broadcast_address() {
        let mac = MacAddress::parse("11:22:33:44:55:66").unwrap();
        let result = send_magic_packet(&mac, "not-a-host.invalid", 9).await;
        assert!(result.is_err());
    }
}
