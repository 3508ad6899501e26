use super::*;
use crate::discovery::StaticPeers;
use crate::peer::{read_message, write_message, Bitfield, BlockInfo, Handshake, PeerMessage};
use crate::seeder::Seeder;
use crate::storage::MemoryFile;
use crate::torrent::{PieceHash, TorrentInfo};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn meta(content: &[u8], piece_length: u64) -> Metainfo {
    let pieces = content.chunks(piece_length as usize).map(PieceHash::of).collect();
    let info = TorrentInfo::new("out.bin".into(), piece_length, content.len() as u64, pieces).unwrap();
    Metainfo::new("http://127.0.0.1/announce".into(), info)
}

fn config() -> ClientConfig {
    ClientConfig {
        peer_id: [1u8; 20],
        requeue_backoff: Duration::from_millis(1),
        ..ClientConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Honest,
    /// Flips a byte in the first block it serves
    CorruptFirst,
    /// Answers with one byte more than requested
    Overrun,
    /// Holds requests until the initiator stops sending, then answers them all
    Lazy,
    /// Never answers
    Silent,
    /// Answers honestly but never sends `unchoke`
    NeverUnchokes,
    /// Sends `have` for this piece in the same segment as its bitfield
    AnnouncesLater(u32),
}

#[derive(Debug, Default)]
struct PeerLog {
    requests: Vec<BlockInfo>,
    /// Every other frame received, in order
    others: Vec<PeerMessage>,
    max_outstanding: usize,
}

/// Accept one connection and serve `content` as the given `have` set.
async fn scripted_peer(
    meta: &Metainfo,
    content: &[u8],
    have: &[usize],
    behaviour: Behaviour,
) -> (SocketAddr, JoinHandle<PeerLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handshake = Handshake::new(meta.info_hash, [9u8; 20]);
    let info = meta.info.clone();
    let content = content.to_vec();
    let mut bitfield = Bitfield::new(info.num_pieces());
    for &index in have {
        bitfield.set_piece(index);
    }

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake.respond(&mut stream, Duration::from_secs(5)).await.unwrap();
        let mut opening = PeerMessage::Bitfield {
            bitfield: bitfield.as_bytes().to_vec(),
        }
        .to_bytes();
        match behaviour {
            Behaviour::NeverUnchokes => {}
            Behaviour::AnnouncesLater(index) => {
                opening.extend(PeerMessage::Have { piece_index: index }.to_bytes());
                opening.extend(PeerMessage::Unchoke.to_bytes());
            }
            _ => opening.extend(PeerMessage::Unchoke.to_bytes()),
        }
        stream.write_all(&opening).await.unwrap();

        // Frames are forwarded over a channel so waiting for a lull never
        // abandons a half-read frame.
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(message) = read_message(&mut reader).await {
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        let serve = |block: BlockInfo| {
            let start = info.piece_offset(block.piece_index as usize) as usize + block.offset as usize;
            PeerMessage::Piece {
                piece_index: block.piece_index,
                offset: block.offset,
                data: content[start..start + block.length as usize].to_vec(),
            }
        };

        let mut log = PeerLog::default();
        let mut pending = Vec::new();
        loop {
            let message = if pending.is_empty() {
                rx.recv().await
            } else {
                match timeout(Duration::from_millis(50), rx.recv()).await {
                    Ok(message) => message,
                    Err(_) => {
                        for block in pending.drain(..) {
                            if write_message(&mut writer, &serve(block)).await.is_err() {
                                return log;
                            }
                        }
                        continue;
                    }
                }
            };

            let Some(message) = message else { break };
            let PeerMessage::Request { block } = message else {
                log.others.push(message);
                continue;
            };
            log.requests.push(block);

            let reply = match behaviour {
                Behaviour::Silent => continue,
                Behaviour::Lazy => {
                    pending.push(block);
                    log.max_outstanding = log.max_outstanding.max(pending.len());
                    continue;
                }
                Behaviour::Honest | Behaviour::NeverUnchokes | Behaviour::AnnouncesLater(_) => serve(block),
                Behaviour::CorruptFirst => {
                    let mut reply = serve(block);
                    if let PeerMessage::Piece { data, .. } = &mut reply {
                        if log.requests.len() == 1 {
                            data[0] ^= 0xFF;
                        }
                    }
                    reply
                }
                Behaviour::Overrun => {
                    let mut reply = serve(block);
                    if let PeerMessage::Piece { data, .. } = &mut reply {
                        data.push(0);
                    }
                    reply
                }
            };
            if write_message(&mut writer, &reply).await.is_err() {
                break;
            }
        }
        log
    });

    (addr, handle)
}

struct CountingSource {
    calls: AtomicUsize,
}

impl PeerSource for CountingSource {
    async fn peers(&self) -> Result<Vec<SocketAddr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_fresh_download_from_one_peer() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let (addr, _peer) = scripted_peer(&meta, content, &[0, 1], Behaviour::Honest).await;

    let client = TorrentClient::new(config());
    let progress = client.subscribe();
    let mut file = MemoryFile::new(vec![0u8; 8]);

    let summary = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap();

    assert_eq!(
        summary,
        TransferSummary {
            total: 2,
            resumed: 0,
            fetched: 2
        }
    );
    assert_eq!(file.data, content);
    assert_eq!(*progress.borrow(), Progress { completed: 2, total: 2 });
}

#[tokio::test]
async fn test_partial_file_fetches_only_missing_piece() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let (addr, peer) = scripted_peer(&meta, content, &[0, 1], Behaviour::Honest).await;

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(b"abcdXXXX".to_vec());

    let summary = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap();

    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.fetched, 1);
    assert_eq!(file.data, content);
    assert_eq!(file.writes, vec![(4, b"efgh".to_vec())]);

    drop(client);
    let log = peer.await.unwrap();
    assert!(log.requests.iter().all(|b| b.piece_index == 1));
}

#[tokio::test]
async fn test_complete_file_never_asks_for_peers() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let source = CountingSource {
        calls: AtomicUsize::new(0),
    };

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(content.to_vec());

    let summary = client.download(&meta, &source, &mut file).await.unwrap();

    assert_eq!(summary.resumed, 2);
    assert_eq!(summary.fetched, 0);
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    assert!(file.writes.is_empty());
}

#[tokio::test]
async fn test_corrupt_piece_is_retried_and_never_written() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let (addr, peer) = scripted_peer(&meta, content, &[0, 1], Behaviour::CorruptFirst).await;

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(vec![0u8; 8]);

    client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap();

    assert_eq!(file.data, content);
    // One write per piece: the corrupt copy never reached the file.
    assert_eq!(file.writes.len(), 2);

    let log = peer.await.unwrap();
    assert_eq!(log.requests.len(), 3);
    assert_eq!(log.requests.iter().filter(|b| b.piece_index == 0).count(), 2);
}

#[tokio::test]
async fn test_overlong_block_drops_the_peer() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let (addr, _peer) = scripted_peer(&meta, content, &[0, 1], Behaviour::Overrun).await;

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(vec![0u8; 8]);

    let err = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap_err();

    assert!(matches!(err, BittorrentError::PeersExhausted { remaining: 2 }), "{err}");
    assert!(file.writes.is_empty());
}

#[tokio::test]
async fn test_requests_are_pipelined_in_blocks() {
    let content: Vec<u8> = (0..102_400u32).map(|i| (i % 251) as u8).collect();
    let meta = meta(&content, 102_400);
    let (addr, peer) = scripted_peer(&meta, &content, &[0], Behaviour::Lazy).await;

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(vec![0u8; content.len()]);

    let summary = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap();
    assert_eq!(summary.fetched, 1);
    assert_eq!(file.data, content);

    drop(client);
    let log = peer.await.unwrap();
    assert_eq!(log.max_outstanding, MAX_BACKLOG);
    assert_eq!(log.requests.len(), 7);
    assert!(log.requests.iter().all(|b| b.length <= BLOCK_SIZE));
    let offsets: Vec<u32> = log.requests.iter().map(|b| b.offset).collect();
    assert_eq!(offsets, (0..7).map(|i| i * BLOCK_SIZE).collect::<Vec<_>>());
    assert_eq!(log.requests[6].length, 4096);
}

#[tokio::test]
async fn test_silent_peer_hits_piece_deadline() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let (addr, _peer) = scripted_peer(&meta, content, &[0, 1], Behaviour::Silent).await;

    let client = TorrentClient::new(ClientConfig {
        piece_timeout: Duration::from_millis(200),
        ..config()
    });
    let mut file = MemoryFile::new(vec![0u8; 8]);

    let err = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap_err();
    assert!(matches!(err, BittorrentError::PeersExhausted { remaining: 2 }), "{err}");
}

#[tokio::test]
async fn test_piece_no_peer_has_is_fatal() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let (addr, _peer) = scripted_peer(&meta, content, &[0], Behaviour::Honest).await;

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(vec![0u8; 8]);

    let err = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap_err();

    assert!(matches!(err, BittorrentError::PieceUnavailable { index: 1 }), "{err}");
    assert_eq!(file.writes, vec![(0, b"abcd".to_vec())]);
}

#[tokio::test]
async fn test_peer_that_never_unchokes_is_still_asked() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let (addr, peer) = scripted_peer(&meta, content, &[0, 1], Behaviour::NeverUnchokes).await;

    let client = TorrentClient::new(ClientConfig {
        piece_timeout: Duration::from_secs(2),
        ..config()
    });
    let mut file = MemoryFile::new(vec![0u8; 8]);

    let summary = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap();
    assert_eq!(summary.fetched, 2);
    assert_eq!(file.data, content);

    drop(client);
    let log = peer.await.unwrap();
    assert!(!log.requests.is_empty());
    // We unchoke and declare interest before asking for anything.
    assert_eq!(log.others[..2], [PeerMessage::Unchoke, PeerMessage::Interested]);
}

#[tokio::test]
async fn test_have_received_before_work_makes_piece_available() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    // The bitfield only lists piece 1; piece 0 is announced right after it.
    let (addr, _peer) = scripted_peer(&meta, content, &[1], Behaviour::AnnouncesLater(0)).await;

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(vec![0u8; 8]);

    let summary = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap();
    assert_eq!(summary.fetched, 2);
    assert_eq!(file.data, content);
}

#[tokio::test]
async fn test_pieces_split_across_peers() {
    let content = b"abcdefghij";
    let meta = meta(content, 4);
    let (first, _a) = scripted_peer(&meta, content, &[0, 2], Behaviour::Honest).await;
    let (second, _b) = scripted_peer(&meta, content, &[1], Behaviour::Honest).await;

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(vec![0u8; 10]);

    let summary = client
        .download(&meta, &StaticPeers(vec![first, second]), &mut file)
        .await
        .unwrap();

    assert_eq!(summary.fetched, 3);
    assert_eq!(file.data, content);
}

#[tokio::test]
async fn test_no_peers_is_exhausted() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);

    let client = TorrentClient::new(config());
    let mut file = MemoryFile::new(b"abcd\0\0\0\0".to_vec());

    let err = client
        .download(&meta, &StaticPeers(Vec::new()), &mut file)
        .await
        .unwrap_err();
    assert!(matches!(err, BittorrentError::PeersExhausted { remaining: 1 }), "{err}");
}

#[tokio::test]
async fn test_cancellation_aborts_transfer() {
    let content = b"abcdefgh";
    let meta = meta(content, 4);
    let (addr, _peer) = scripted_peer(&meta, content, &[0, 1], Behaviour::Silent).await;

    let client = TorrentClient::new(config());
    let cancel = client.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let mut file = MemoryFile::new(vec![0u8; 8]);

    let err = client
        .download(&meta, &StaticPeers(vec![addr]), &mut file)
        .await
        .unwrap_err();
    assert!(matches!(err, BittorrentError::Cancelled));
}

#[tokio::test]
async fn test_end_to_end_with_seeder() {
    let content: Vec<u8> = (0..70_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let meta = meta(&content, 32_768);
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.bin");
    tokio::fs::write(&source, &content).await.unwrap();

    let seeder = Seeder::bind("127.0.0.1:0".parse().unwrap(), &meta, &source, [2u8; 20])
        .await
        .unwrap();
    let peers = StaticPeers(vec![seeder.local_addr().unwrap()]);
    let stop = CancellationToken::new();
    tokio::spawn(seeder.run(stop.clone()));

    let client = TorrentClient::new(config());
    let progress = client.subscribe();
    let dest = dir.path().join("out/dest.bin");

    let summary = client.download_to(&meta, &peers, &dest).await.unwrap();
    assert_eq!(summary.fetched, 3);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
    assert_eq!(*progress.borrow(), Progress { completed: 3, total: 3 });

    // A second run finds everything on disk and needs no peers.
    stop.cancel();
    let again = client
        .download_to(&meta, &StaticPeers(Vec::new()), &dest)
        .await
        .unwrap();
    assert_eq!(again.resumed, 3);
    assert_eq!(again.fetched, 0);
}

#[test]
fn test_progress_percent() {
    assert_eq!(Progress { completed: 1, total: 4 }.percent(), 25.0);
    assert_eq!(Progress::default().percent(), 100.0);
}
