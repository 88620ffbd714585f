//! End-to-end transfers driving both ends of the protocol over an
//! in-memory duplex pipe from separate threads.

use modem_proto::packet::control;
use modem_proto::task::Task;
use modem_proto::xmodem::{self, XmodemConfig};
use modem_proto::ymodem::{self, FileSource, YmodemConfig};
use modem_proto::profile::ProgramProfile;
use std::cell::RefCell;
use std::fs;
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::rc::Rc;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;
use std::time::Duration;

struct BidirectionalPipe {
    pin: Receiver<u8>,
    pout: SyncSender<u8>,
}

impl Read for BidirectionalPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        for slot in buf.iter_mut() {
            *slot = self
                .pin
                .recv_timeout(Duration::from_millis(500))
                .map_err(|_| io::Error::new(ErrorKind::TimedOut, "no data"))?;
        }
        Ok(buf.len())
    }
}

impl Write for BidirectionalPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            self.pout.send(b).map_err(|_| {
                io::Error::new(ErrorKind::BrokenPipe, "peer hung up")
            })?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn loopback() -> (BidirectionalPipe, BidirectionalPipe) {
    let (s1, r1) = sync_channel(4096);
    let (s2, r2) = sync_channel(4096);
    (
        BidirectionalPipe { pin: r1, pout: s2 },
        BidirectionalPipe { pin: r2, pout: s1 },
    )
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i + 7) * 13) as u8).collect()
}

fn xmodem_roundtrip(use_1k: bool, use_crc: bool, len: usize) {
    let data = pattern(len);
    let (mut p1, mut p2) = loopback();
    let cfg = XmodemConfig {
        use_1k,
        ..Default::default()
    };

    let send_cfg = cfg.clone();
    let send_data = data.clone();
    let sender = thread::spawn(move || {
        let mut src = Cursor::new(send_data);
        xmodem::send(&mut p1, &mut src, &send_cfg, None).unwrap()
    });
    let recv_cfg = cfg.clone();
    let receiver = thread::spawn(move || {
        let mut dest = Vec::new();
        let ok = xmodem::recv(&mut p2, &mut dest, &recv_cfg, use_crc, None).unwrap();
        (ok, dest)
    });

    assert!(sender.join().unwrap());
    let (ok, received) = receiver.join().unwrap();
    assert!(ok);
    assert_eq!(&received[..data.len()], &data[..]);
}

#[test]
fn xmodem_loopback_standard() {
    xmodem_roundtrip(false, false, 2000);
}

#[test]
fn xmodem_loopback_onek() {
    xmodem_roundtrip(true, false, 2200);
}

#[test]
fn xmodem_loopback_crc() {
    xmodem_roundtrip(false, true, 2000);
}

#[test]
fn xmodem_loopback_wraps_sequence_counter() {
    // 50000 bytes / 128 per block is well past 256 blocks, exercising
    // the wrapping seq/complement arithmetic.
    xmodem_roundtrip(false, true, 50_000);
}

/// Wraps a loopback pipe so the bytes the *sender* writes onto the wire
/// can be tampered with once: either corrupting a byte at a fixed
/// position (simulating line noise inside a block) or silently dropping
/// the first occurrence of a given byte (simulating a lost ACK).
struct FlakyPipe {
    inner: BidirectionalPipe,
    write_count: usize,
    corrupt_at: Option<usize>,
    corrupted: bool,
    drop_byte: Option<u8>,
    dropped: bool,
}

impl FlakyPipe {
    fn corrupting(inner: BidirectionalPipe, at: usize) -> Self {
        FlakyPipe {
            inner,
            write_count: 0,
            corrupt_at: Some(at),
            corrupted: false,
            drop_byte: None,
            dropped: false,
        }
    }

    fn dropping(inner: BidirectionalPipe, byte: u8) -> Self {
        FlakyPipe {
            inner,
            write_count: 0,
            corrupt_at: None,
            corrupted: false,
            drop_byte: Some(byte),
            dropped: false,
        }
    }
}

impl Read for FlakyPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for FlakyPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = Vec::with_capacity(buf.len());
        for &b in buf {
            let idx = self.write_count;
            self.write_count += 1;
            if !self.corrupted && self.corrupt_at == Some(idx) {
                self.corrupted = true;
                out.push(b ^ 0x01);
                continue;
            }
            if !self.dropped && self.drop_byte == Some(b) {
                self.dropped = true;
                continue;
            }
            out.push(b);
        }
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[test]
fn xmodem_corrupted_block_is_nakked_and_retransmitted() {
    // Flip a bit a few bytes into the first block (past header/seq/
    // complement, inside the payload) so the receiver's trailer check
    // fails and it NAKs instead of accepting, driving a retransmit
    // through `recv_one_block`'s reject branch.
    let data = pattern(2000);
    let (p1, p2) = loopback();
    let flaky = FlakyPipe::corrupting(p1, 10);
    let cfg = XmodemConfig::default();

    let send_cfg = cfg.clone();
    let send_data = data.clone();
    let sender = thread::spawn(move || {
        let mut flaky = flaky;
        let mut src = Cursor::new(send_data);
        xmodem::send(&mut flaky, &mut src, &send_cfg, None).unwrap()
    });
    let recv_cfg = cfg.clone();
    let receiver = thread::spawn(move || {
        let mut p2 = p2;
        let mut dest = Vec::new();
        let ok = xmodem::recv(&mut p2, &mut dest, &recv_cfg, true, None).unwrap();
        (ok, dest)
    });

    assert!(sender.join().unwrap());
    let (ok, received) = receiver.join().unwrap();
    assert!(ok);
    assert_eq!(&received[..data.len()], &data[..]);
}

#[test]
fn xmodem_dropped_ack_resyncs_on_duplicate_block() {
    // Drop the receiver's first ACK on the wire; the sender times out
    // and retransmits block 1, so the receiver sees a duplicate of the
    // last accepted sequence number and must re-ACK without rewriting
    // it, instead of NAKing or accepting it as new data.
    let data = pattern(600);
    let (p1, p2) = loopback();
    let flaky = FlakyPipe::dropping(p2, control::ACK);
    let cfg = XmodemConfig::default();

    let send_cfg = cfg.clone();
    let send_data = data.clone();
    let sender = thread::spawn(move || {
        let mut p1 = p1;
        let mut src = Cursor::new(send_data);
        xmodem::send(&mut p1, &mut src, &send_cfg, None).unwrap()
    });
    let recv_cfg = cfg.clone();
    let receiver = thread::spawn(move || {
        let mut flaky = flaky;
        let mut dest = Vec::new();
        let ok = xmodem::recv(&mut flaky, &mut dest, &recv_cfg, true, None).unwrap();
        (ok, dest)
    });

    assert!(sender.join().unwrap());
    let (ok, received) = receiver.join().unwrap();
    assert!(ok);
    assert_eq!(&received[..data.len()], &data[..]);
}

struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn ymodem_roundtrip(cfg: YmodemConfig, files: Vec<(&'static str, Vec<u8>)>) -> Vec<(String, Vec<u8>)> {
    let (mut p1, mut p2) = loopback();

    let send_cfg = cfg.clone();
    let send_files = files.clone();
    let sender = thread::spawn(move || {
        let mut cursors: Vec<Cursor<Vec<u8>>> =
            send_files.iter().map(|(_, d)| Cursor::new(d.clone())).collect();
        let mut sources: Vec<FileSource<'_>> = send_files
            .iter()
            .zip(cursors.iter_mut())
            .map(|((name, data), cur)| FileSource {
                task: Task::for_send((*name).to_string(), data.len() as u64, 0, 0),
                reader: cur,
            })
            .collect();
        ymodem::send(&mut p1, &mut sources, &send_cfg, None).unwrap()
    });

    let recv_cfg = cfg.clone();
    let receiver = thread::spawn(move || {
        let mut order: Vec<String> = Vec::new();
        let mut buffers: Vec<Rc<RefCell<Vec<u8>>>> = Vec::new();
        let ok = {
            let order = &mut order;
            let buffers = &mut buffers;
            ymodem::recv(
                &mut p2,
                &recv_cfg,
                move |task| {
                    let buf = Rc::new(RefCell::new(Vec::new()));
                    order.push(task.name.clone());
                    buffers.push(buf.clone());
                    Ok(Box::new(SharedBuf(buf)) as Box<dyn Write>)
                },
                None,
            )
            .unwrap()
        };
        let results = order
            .into_iter()
            .zip(buffers.into_iter().map(|b| Rc::try_unwrap(b).unwrap().into_inner()))
            .collect::<Vec<_>>();
        (ok, results)
    });

    assert!(sender.join().unwrap());
    let (ok, results) = receiver.join().unwrap();
    assert!(ok);
    results
}

#[test]
fn ymodem_batch_two_files() {
    let cfg = YmodemConfig {
        profile: ProgramProfile::RzSz,
        request_1k: true,
        ..Default::default()
    };
    let files = vec![
        ("alpha.bin", pattern(3000)),
        ("beta.txt", pattern(150)),
    ];
    let results = ymodem_roundtrip(cfg, files.clone());
    assert_eq!(results.len(), 2);
    for ((expected_name, expected_data), (name, data)) in files.iter().zip(results.iter()) {
        assert_eq!(name, expected_name);
        assert_eq!(data, expected_data);
    }
}

#[test]
fn ymodem_g_streaming() {
    let cfg = YmodemConfig {
        profile: ProgramProfile::ProYam,
        request_1k: true,
        streaming: true,
        ..Default::default()
    };
    let files = vec![("stream.bin", pattern(4096))];
    let results = ymodem_roundtrip(cfg, files.clone());
    assert_eq!(results[0].1, files[0].1);
}

#[test]
fn ymodem_recv_writes_files_to_disk() {
    // Exercises the receiver against a real filesystem destination
    // instead of an in-memory buffer, matching how the CLI binary opens
    // files through the same `open` callback.
    let dir = tempfile::tempdir().unwrap();
    let dir_path = dir.path().to_path_buf();

    let cfg = YmodemConfig {
        profile: ProgramProfile::RzSz,
        request_1k: true,
        ..Default::default()
    };
    let files = vec![
        ("report.txt", pattern(500)),
        ("image.bin", pattern(2500)),
    ];

    let (mut p1, mut p2) = loopback();
    let send_cfg = cfg.clone();
    let send_files = files.clone();
    let sender = thread::spawn(move || {
        let mut cursors: Vec<Cursor<Vec<u8>>> =
            send_files.iter().map(|(_, d)| Cursor::new(d.clone())).collect();
        let mut sources: Vec<FileSource<'_>> = send_files
            .iter()
            .zip(cursors.iter_mut())
            .map(|((name, data), cur)| FileSource {
                task: Task::for_send((*name).to_string(), data.len() as u64, 0, 0),
                reader: cur,
            })
            .collect();
        ymodem::send(&mut p1, &mut sources, &send_cfg, None).unwrap()
    });

    let recv_cfg = cfg.clone();
    let recv_dir = dir_path.clone();
    let receiver = thread::spawn(move || {
        let open = move |task: &Task| -> modem_proto::Result<Box<dyn Write>> {
            let dest = fs::File::create(recv_dir.join(&task.name))?;
            Ok(Box::new(dest))
        };
        ymodem::recv(&mut p2, &recv_cfg, open, None).unwrap()
    });

    assert!(sender.join().unwrap());
    assert!(receiver.join().unwrap());

    for (name, expected) in &files {
        let on_disk = fs::read(dir_path.join(name)).unwrap();
        assert_eq!(&on_disk, expected);
    }
}

#[test]
fn xmodem_cancel_from_receiver_reports_failure() {
    let (mut p1, mut p2) = loopback();
    let cfg = XmodemConfig::default();

    let sender = thread::spawn(move || {
        let mut src = Cursor::new(pattern(1000));
        xmodem::send(&mut p1, &mut src, &cfg, None)
    });
    // Act as a receiver that immediately cancels instead of negotiating.
    p2.write_all(&[0x18, 0x18]).unwrap();

    let ok = sender.join().unwrap().unwrap();
    assert!(!ok);
}
