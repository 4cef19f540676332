//! Transport reader and status exchange over the in-memory link.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use semfi::semio::sim::MemoryLink;
use semfi::semio::{SemProtocol, SerialLinkConfig, Transport};

fn transport(link: &MemoryLink) -> Arc<Transport> {
    let (r, w) = link.endpoints();
    let tr = Arc::new(Transport::from_parts(SerialLinkConfig::new("mem", 115_200), r, w));
    tr.start_reader().unwrap();
    tr
}

#[test]
fn concurrent_consumers_never_see_the_same_line() {
    let link = MemoryLink::new();
    let tr = transport(&link);
    for i in 0..200 {
        link.push_line(&format!("L{i:03}"));
    }
    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let tr = Arc::clone(&tr);
            std::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    let batch = tr.read_lines(Duration::from_millis(150));
                    if batch.is_empty() {
                        break;
                    }
                    got.extend(batch.into_iter().map(|l| l.text));
                }
                got
            })
        })
        .collect();
    let mut all = Vec::new();
    for c in consumers {
        all.extend(c.join().unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
    tr.close();
}

#[test]
fn lines_keep_arrival_order_and_timestamps_do_not_go_back() {
    let link = MemoryLink::new();
    let tr = transport(&link);
    link.push_bytes(b"SC 1");
    link.push_bytes(b"0\r\nSC 00\r\n\r\nI>\r\n");
    let lines = tr.read_until_prompt(Duration::from_secs(1));
    let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, ["SC 10", "SC 00", "I>"]);
    assert!(lines.windows(2).all(|w| w[0].received_at <= w[1].received_at));
    tr.close();
}

#[test]
fn status_reply_parses_into_snapshot() {
    let link = MemoryLink::new();
    link.set_responder(|cmd| {
        if cmd == "S" {
            vec!["FC 00".into(), "SC 00".into(), "I>".into()]
        } else {
            Vec::new()
        }
    });
    let tr = transport(&link);
    let proto = SemProtocol::new(Arc::clone(&tr));
    let (snap, lines) = proto.status(Duration::from_secs(1)).unwrap();
    assert_eq!(lines.len(), 3);
    assert_eq!(snap.get("FC"), Some("00"));
    assert_eq!(snap.get("SC"), Some("00"));
    assert_eq!(snap.len(), 2);
    assert_eq!(link.sent_raw(), b"S\r");
    tr.close();
}

#[test]
fn silent_device_gives_empty_snapshot() {
    let link = MemoryLink::new();
    let tr = transport(&link);
    let proto = SemProtocol::new(Arc::clone(&tr));
    let (snap, lines) = proto.status(Duration::from_millis(200)).unwrap();
    assert!(snap.is_empty());
    assert!(lines.is_empty());
    tr.close();
}

#[test]
fn writes_after_close_are_rejected() {
    let link = MemoryLink::new();
    let tr = transport(&link);
    tr.close();
    tr.close();
    assert!(!tr.is_open());
    assert!(tr.write_line("S").is_err());
}
