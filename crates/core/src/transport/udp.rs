use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use crate::error::Result;

/// Short-lived UDP sender for one announcement burst.
///
/// Binds an ephemeral port on `interface`, applies the multicast TTL,
/// writes every packet `repeat` times and is dropped afterwards. Keeping
/// send sockets separate from the listening socket means a burst never
/// competes with the receive loop.
pub struct BurstSender {
    socket: UdpSocket,
}

impl BurstSender {
    pub fn bind(interface: Ipv4Addr, ttl: u32) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(interface, 0))?;
        socket.set_multicast_ttl_v4(ttl)?;
        if !interface.is_unspecified() {
            socket.set_multicast_loop_v4(true)?;
        }
        Ok(Self { socket })
    }

    /// Send each packet `repeat` times in order. Returns the bytes written.
    pub fn send_burst(&self, packets: &[Vec<u8>], dest: SocketAddr, repeat: usize) -> Result<usize> {
        let mut total = 0;
        for _ in 0..repeat.max(1) {
            for packet in packets {
                total += self.socket.send_to(packet, dest)?;
            }
        }
        Ok(total)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_repeats_every_packet() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let sender = BurstSender::bind(Ipv4Addr::LOCALHOST, 2).unwrap();

        let packets = vec![b"one".to_vec(), b"two".to_vec()];
        let written = sender
            .send_burst(&packets, receiver.local_addr().unwrap(), 2)
            .unwrap();
        assert_eq!(written, 12);

        let mut buf = [0u8; 16];
        let order: Vec<Vec<u8>> = (0..4)
            .map(|_| {
                let n = receiver.recv(&mut buf).unwrap();
                buf[..n].to_vec()
            })
            .collect();
        assert_eq!(order, vec![b"one".to_vec(), b"two".to_vec(), b"one".to_vec(), b"two".to_vec()]);
    }
}
