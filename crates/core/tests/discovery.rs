//! Integration tests: SSDP search between two services on loopback.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use upnp::discovery::packet::ROOT_DEVICE;
use upnp::{Announcement, AnnouncementKind, DiscoveryConfig, SsdpService, WireMessage};

fn service(max_mx: u32) -> SsdpService {
    SsdpService::new(
        DiscoveryConfig::default()
            .with_port(0)
            .with_interface(Ipv4Addr::LOCALHOST)
            .with_max_mx(max_mx),
    )
}

fn device_addr(device: &SsdpService) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, device.local_port().unwrap()))
}

#[test]
fn unicast_search_is_answered_within_mx() {
    let device = service(5);
    device.advertise_device("5d3a-device", "http://127.0.0.1:49152/desc.xml", &[]);
    device.start().unwrap();

    let control = service(5);
    let (tx, rx) = mpsc::channel();
    control.subscribe(move |a: &Announcement, from| {
        let _ = tx.send((a.clone(), from));
    });
    control.start().unwrap();

    let sent = Instant::now();
    control.search_to(device_addr(&device), ROOT_DEVICE, 1).unwrap();

    let (response, _from) = loop {
        let (a, from) = rx.recv_timeout(Duration::from_secs(4)).unwrap();
        if a.kind == AnnouncementKind::SearchResponse {
            break (a, from);
        }
    };
    assert!(sent.elapsed() <= Duration::from_millis(2500));
    assert_eq!(response.search_target, ROOT_DEVICE);
    assert_eq!(response.usn, "uuid:5d3a-device::upnp:rootdevice");
    assert_eq!(response.location.as_deref(), Some("http://127.0.0.1:49152/desc.xml"));
    assert_eq!(response.max_age, 1800);

    control.shutdown();
    device.shutdown();
}

#[test]
fn invalid_searches_produce_no_response() {
    let device = service(5);
    device.advertise_device("quiet", "http://127.0.0.1/d.xml", &[]);
    device.start().unwrap();
    let target = device_addr(&device);

    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let good = "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nMX: 1\r\nST: ssdp:all\r\n\r\n";
    let bad = [
        good.replace("MX: 1\r\n", ""),
        good.replace("ssdp:discover", "ssdp:nope"),
        good.replace("HTTP/1.1", "HTTP/1.0"),
    ];
    for raw in &bad {
        probe.send_to(raw.as_bytes(), target).unwrap();
    }

    let deadline = Instant::now() + Duration::from_millis(1800);
    let mut buf = [0u8; 2048];
    while Instant::now() < deadline {
        if let Ok((n, _)) = probe.recv_from(&mut buf) {
            let message = WireMessage::parse(&buf[..n]).unwrap();
            panic!("unexpected answer: {:?}", message.start);
        }
    }

    probe.send_to(good.as_bytes(), target).unwrap();
    probe
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let (n, _) = probe.recv_from(&mut buf).unwrap();
    let answer = WireMessage::parse(&buf[..n]).unwrap();
    assert_eq!(answer.status(), Some(200));
    device.shutdown();
}

#[test]
fn unsubscribed_listener_stops_receiving() {
    let device = service(1);
    device.start().unwrap();
    let (tx, rx) = mpsc::channel();
    let id = device.subscribe(move |a: &Announcement, _| {
        let _ = tx.send(a.usn.clone());
    });

    let notify = Announcement::alive("uuid:peer", "uuid:peer", "http://127.0.0.1/p.xml", 60)
        .to_message("test", "239.255.255.250:1900".parse().unwrap())
        .to_bytes();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(&notify, device_addr(&device)).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "uuid:peer");

    assert!(device.unsubscribe(id));
    sender.send_to(&notify, device_addr(&device)).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    device.shutdown();
}
