//! Tun device seam
//!
//! The tun driver itself lives outside the core: whatever opens the device
//! bridges it to the event loop through a pair of bounded packet channels,
//! one frame per message. Frames carry the 4-byte platform header (flags,
//! ethertype); the helpers here add and strip it so the rest of the core
//! deals in bare IPv4 datagrams.

use std::net::Ipv4Addr;
use tokio::sync::mpsc;

/// Platform tun header: u16 flags, u16 ethertype.
pub const TUN_HDR_LEN: usize = 4;

/// Frames queued per direction before the slower side pushes back.
const TUN_CHANNEL_DEPTH: usize = 1000;

/// Loop side of the device bridge.
#[derive(Debug)]
pub struct TunChannel {
    /// Frames read from the device
    pub rx: mpsc::Receiver<Vec<u8>>,
    /// Frames to write to the device
    pub tx: mpsc::Sender<Vec<u8>>,
}

/// Driver side of the device bridge.
#[derive(Debug)]
pub struct TunHandle {
    /// Frames read from the device go here
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Frames to write to the device come out here
    pub rx: mpsc::Receiver<Vec<u8>>,
}

impl TunChannel {
    /// Create both halves of the bridge.
    pub fn pair() -> (TunChannel, TunHandle) {
        let (dev_tx, loop_rx) = mpsc::channel(TUN_CHANNEL_DEPTH);
        let (loop_tx, dev_rx) = mpsc::channel(TUN_CHANNEL_DEPTH);
        (
            TunChannel {
                rx: loop_rx,
                tx: loop_tx,
            },
            TunHandle {
                tx: dev_tx,
                rx: dev_rx,
            },
        )
    }
}

/// Wrap an IPv4 packet in the platform tun header.
pub fn add_header(packet: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(TUN_HDR_LEN + packet.len());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&(libc::ETH_P_IP as u16).to_be_bytes());
    frame.extend_from_slice(packet);
    frame
}

/// Strip the platform tun header; `None` for runts.
pub fn strip_header(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() <= TUN_HDR_LEN {
        return None;
    }
    Some(&frame[TUN_HDR_LEN..])
}

/// Destination address of an IPv4 packet, if it looks like one.
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let packet = vec![0x45, 0, 0, 20];
        let frame = add_header(&packet);
        assert_eq!(frame.len(), packet.len() + TUN_HDR_LEN);
        assert_eq!(strip_header(&frame).unwrap(), &packet[..]);
        assert!(strip_header(&frame[..4]).is_none());
    }

    #[test]
    fn test_channel_pair_shuttles_frames() {
        tokio_test::block_on(async {
            let (mut chan, mut handle) = TunChannel::pair();

            handle.tx.send(vec![1, 2, 3]).await.unwrap();
            assert_eq!(chan.rx.recv().await.unwrap(), vec![1, 2, 3]);

            chan.tx.send(vec![4]).await.unwrap();
            assert_eq!(handle.rx.recv().await.unwrap(), vec![4]);
        });
    }

    #[test]
    fn test_ipv4_destination() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&[10, 0, 0, 2]);
        assert_eq!(ipv4_destination(&packet), Some(Ipv4Addr::new(10, 0, 0, 2)));

        packet[0] = 0x60; // IPv6 version nibble
        assert_eq!(ipv4_destination(&packet), None);
        assert_eq!(ipv4_destination(&packet[..10]), None);
    }
}
