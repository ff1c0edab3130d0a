use super::*;
use crate::config::AllocType;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tempfile::TempDir;

const CHUNK: u32 = 16384;

struct Fixture {
    temp: TempDir,
    content: Vec<u8>,
    piece_length: u64,
}

impl Fixture {
    fn new(piece_length: u64, total: usize) -> Self {
        let content = (0..total).map(|i| ((i * 7 + i / 251) % 256) as u8).collect();
        Self {
            temp: TempDir::new().unwrap(),
            content,
            piece_length,
        }
    }

    fn piece_count(&self) -> usize {
        (self.content.len() as u64).div_ceil(self.piece_length) as usize
    }

    fn hashes(&self) -> Vec<[u8; 20]> {
        self.content
            .chunks(self.piece_length as usize)
            .map(|piece| Sha1::digest(piece).into())
            .collect()
    }

    fn piece(&self, index: usize) -> &[u8] {
        let start = index * self.piece_length as usize;
        let end = (start + self.piece_length as usize).min(self.content.len());
        &self.content[start..end]
    }

    fn path(&self) -> PathBuf {
        self.temp.path().join("data.bin")
    }

    fn files(&self) -> Vec<FileEntry> {
        vec![FileEntry::new(
            PathBuf::from("data.bin"),
            self.content.len() as u64,
            0,
        )]
    }

    async fn open(&self, options: StorageOptions, snapshot: Option<Snapshot>) -> StorageWrapper {
        let backend = StorageBackend::open(self.temp.path().to_path_buf(), self.files())
            .await
            .unwrap();
        StorageWrapper::open(
            backend,
            self.hashes(),
            self.piece_length,
            options,
            snapshot,
            |_| {},
        )
        .await
        .unwrap()
    }

    /// Requests and delivers every chunk of `piece` from `source`.
    async fn download(
        &self,
        storage: &mut StorageWrapper,
        piece: usize,
        source: Option<IpAddr>,
    ) -> PieceStatus {
        let mut status = PieceStatus::Incomplete;
        while let Ok((begin, length)) = storage.new_request(piece) {
            let data = self.chunk(piece, begin, length);
            status = storage.piece_came_in(piece, begin, data, source).await.unwrap();
        }
        status
    }

    fn chunk(&self, piece: usize, begin: u32, length: u32) -> Bytes {
        let start = begin as usize;
        Bytes::copy_from_slice(&self.piece(piece)[start..start + length as usize])
    }
}

fn options(alloc_type: AllocType) -> StorageOptions {
    StorageOptions {
        alloc_type,
        ..StorageOptions::default()
    }
}

fn ip(last: u8) -> Option<IpAddr> {
    Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
}

fn assert_accounting(storage: &StorageWrapper) {
    assert_eq!(
        storage.amount_inactive()
            + storage.amount_active()
            + storage.amount_received()
            + storage.amount_verified(),
        storage.amount_desired()
    );
}

#[tokio::test]
async fn test_new_request_slices_lazily() {
    let fixture = Fixture::new(40000, 100000);
    let mut storage = fixture.open(StorageOptions::default(), None).await;

    assert!(storage.is_unstarted(0));
    assert_eq!(storage.inactive_requests(0), None);
    assert_eq!(storage.new_request(0).unwrap(), (0, CHUNK));
    assert!(!storage.is_unstarted(0));
    assert_eq!(storage.new_request(0).unwrap(), (CHUNK, CHUNK));
    assert_eq!(storage.new_request(0).unwrap(), (2 * CHUNK, 40000 - 2 * CHUNK));
    assert!(matches!(storage.new_request(0), Err(StorageError::NoRequest(0))));
    assert!(!storage.do_i_have_requests(0));
    assert_accounting(&storage);

    let last = storage.piece_count() - 1;
    assert_eq!(storage.piece_size(last), 20000);
    assert!(matches!(storage.new_request(9), Err(StorageError::InvalidPieceIndex(9))));
}

#[tokio::test]
async fn test_request_lost_keeps_order() {
    let fixture = Fixture::new(65536, 65536);
    let mut storage = fixture.open(StorageOptions::default(), None).await;

    let requests: Vec<_> = (0..4).map(|_| storage.new_request(0).unwrap()).collect();
    storage.request_lost(0, requests[2].0, requests[2].1);
    storage.request_lost(0, requests[0].0, requests[0].1);
    storage.request_lost(0, requests[0].0, requests[0].1);

    assert_eq!(
        storage.inactive_requests(0).unwrap(),
        &[requests[0], requests[2]]
    );
    assert_eq!(storage.amount_active(), 2 * CHUNK as u64);
    assert_accounting(&storage);
}

#[tokio::test]
async fn test_piece_completes_and_reads_back() {
    let fixture = Fixture::new(32768, 70000);
    let mut storage = fixture.open(StorageOptions::default(), None).await;

    for piece in 0..fixture.piece_count() {
        let status = fixture.download(&mut storage, piece, ip(1)).await;
        assert_eq!(
            status,
            PieceStatus::Complete {
                good: vec![ip(1).unwrap()],
                bad: vec![]
            }
        );
        assert_accounting(&storage);
    }

    assert!(storage.is_complete());
    assert_eq!(storage.amount_left(), 0);
    assert_eq!(storage.have_list().count(), 3);

    let data = storage.get_piece(1, 100, 1000).await.unwrap();
    assert_eq!(&data[..], &fixture.piece(1)[100..1100]);
    let tail = storage.get_piece(2, 0, 4464).await.unwrap();
    assert_eq!(&tail[..], fixture.piece(2));
    assert!(storage.get_piece(2, 0, 5000).await.is_err());

    storage.close().await.unwrap();
    assert_eq!(std::fs::read(fixture.path()).unwrap(), fixture.content);
}

#[tokio::test]
async fn test_chunk_for_held_piece_is_ignored() {
    let fixture = Fixture::new(16384, 32768);
    let mut storage = fixture.open(StorageOptions::default(), None).await;
    fixture.download(&mut storage, 0, None).await;

    let status = storage
        .piece_came_in(0, 0, fixture.chunk(0, 0, CHUNK), None)
        .await
        .unwrap();
    assert_eq!(status, PieceStatus::Ignored);
    assert!(matches!(
        storage.piece_came_in(1, 16000, fixture.chunk(1, 0, 1000), None).await,
        Err(StorageError::InvalidBlockOffset { piece: 1, .. })
    ));
}

#[tokio::test]
async fn test_hash_failure_blames_single_source() {
    let fixture = Fixture::new(32768, 65536);
    let mut storage = fixture.open(StorageOptions::default(), None).await;

    let first = storage.new_request(0).unwrap();
    let second = storage.new_request(0).unwrap();
    storage
        .piece_came_in(0, first.0, Bytes::from(vec![0u8; first.1 as usize]), ip(7))
        .await
        .unwrap();
    let status = storage
        .piece_came_in(0, second.0, fixture.chunk(0, second.0, second.1), ip(7))
        .await
        .unwrap();

    assert_eq!(status, PieceStatus::Rejected { culprit: ip(7) });
    assert!(!storage.do_i_have(0));
    assert!(storage.do_i_have_requests(0));
    assert_eq!(storage.num_flunked(), 1);
    assert_accounting(&storage);

    let status = fixture.download(&mut storage, 0, ip(8)).await;
    assert!(matches!(status, PieceStatus::Complete { ref bad, .. } if bad.is_empty()));
}

#[tokio::test]
async fn test_hash_failure_with_two_sources() {
    let fixture = Fixture::new(32768, 65536);
    let mut storage = fixture.open(StorageOptions::default(), None).await;

    // A sends a corrupt first half, B a good second half.
    let a = storage.new_request(0).unwrap();
    let b = storage.new_request(0).unwrap();
    storage
        .piece_came_in(0, a.0, Bytes::from(vec![0xAA; a.1 as usize]), ip(1))
        .await
        .unwrap();
    let status = storage
        .piece_came_in(0, b.0, fixture.chunk(0, b.0, b.1), ip(2))
        .await
        .unwrap();
    assert_eq!(status, PieceStatus::Rejected { culprit: None });
    assert_eq!(storage.inactive_requests(0), None);
    assert_accounting(&storage);

    // Both chunks come again from C; only A's bytes change.
    let status = fixture.download(&mut storage, 0, ip(3)).await;
    assert_eq!(
        status,
        PieceStatus::Complete {
            good: vec![ip(3).unwrap()],
            bad: vec![ip(1).unwrap()],
        }
    );
}

#[tokio::test]
async fn test_write_buffer_flushes_over_quota() {
    let fixture = Fixture::new(32768, 131072);
    let mut storage = fixture
        .open(
            StorageOptions {
                write_buffer_bytes: 40000,
                ..StorageOptions::default()
            },
            None,
        )
        .await;

    for piece in 0..3 {
        let (begin, length) = storage.new_request(piece).unwrap();
        storage
            .piece_came_in(piece, begin, fixture.chunk(piece, begin, length), None)
            .await
            .unwrap();
    }

    // Piece 0 was pushed out of the buffer, pieces 1 and 2 were not.
    let on_disk = std::fs::read(fixture.path()).unwrap();
    assert_eq!(&on_disk[..CHUNK as usize], &fixture.piece(0)[..CHUNK as usize]);
    let snapshot = storage.pickle();
    assert_eq!(snapshot.partials, vec![(0, vec![(0, CHUNK)])]);

    storage.flush().await.unwrap();
    assert_eq!(storage.pickle().partials.len(), 3);
}

#[tokio::test]
async fn test_resume_from_snapshot() {
    let piece_length = 65536u64;
    let fixture = Fixture::new(piece_length, 10 * piece_length as usize);
    let half = piece_length / 2;

    let snapshot = {
        let mut storage = fixture.open(StorageOptions::default(), None).await;
        for piece in 0..7 {
            fixture.download(&mut storage, piece, None).await;
        }
        for _ in 0..2 {
            let (begin, length) = storage.new_request(8).unwrap();
            storage
                .piece_came_in(8, begin, fixture.chunk(8, begin, length), None)
                .await
                .unwrap();
        }
        storage.flush().await.unwrap();
        storage.pickle()
    };

    let mut storage = fixture
        .open(StorageOptions::default(), Some(snapshot.clone()))
        .await;
    assert_eq!(storage.have_list().count(), 7);
    assert_eq!(storage.amount_left(), 3 * piece_length - half);
    assert_eq!(
        storage.inactive_requests(8).unwrap(),
        &[(2 * CHUNK, CHUNK), (3 * CHUNK, CHUNK)]
    );
    assert_eq!(storage.pickle(), snapshot);
    assert_accounting(&storage);

    fixture.download(&mut storage, 8, None).await;
    assert!(storage.do_i_have(8));
}

#[tokio::test]
async fn test_resume_drops_invalid_entries() {
    let fixture = Fixture::new(16384, 16384 * 4);
    std::fs::write(fixture.path(), &fixture.content[..16384 * 2]).unwrap();

    let mut snapshot = Snapshot::new(4);
    snapshot.have.set(0);
    snapshot.have.set(3);
    snapshot.places = vec![(0, 1)];
    snapshot.partials = vec![(2, vec![(0, 100)]), (7, vec![(0, CHUNK)])];

    let storage = fixture.open(StorageOptions::default(), Some(snapshot)).await;
    // Sparse storage ignores placements; piece 3 lies past the end of the
    // file; the partial range is not a request boundary; piece 7 is bogus.
    assert!(storage.do_i_have(0));
    assert!(!storage.do_i_have(3));
    assert_eq!(storage.slot_of(0), Some(0));
    assert!(storage.partial_pieces().is_empty());
    assert_accounting(&storage);
}

#[tokio::test]
async fn test_check_hashes_rejects_stale_snapshot() {
    let fixture = Fixture::new(16384, 16384 * 2);
    let mut data = fixture.content.clone();
    data[5] ^= 0xFF;
    std::fs::write(fixture.path(), &data).unwrap();

    let snapshot = Snapshot {
        have: crate::peer::Bitfield::full(2),
        ..Snapshot::new(2)
    };
    let options = StorageOptions {
        check_hashes: true,
        ..StorageOptions::default()
    };
    let storage = fixture.open(options, Some(snapshot)).await;
    assert!(!storage.do_i_have(0));
    assert!(storage.do_i_have(1));
}

#[tokio::test]
async fn test_startup_check_finds_existing_data() {
    let fixture = Fixture::new(16384, 16384 * 3 + 100);
    let mut data = fixture.content.clone();
    data[16384 + 3] ^= 1;
    std::fs::write(fixture.path(), &data).unwrap();

    let mut reports = Vec::new();
    let backend = StorageBackend::open(fixture.temp.path().to_path_buf(), fixture.files())
        .await
        .unwrap();
    let storage = StorageWrapper::open(
        backend,
        fixture.hashes(),
        fixture.piece_length,
        StorageOptions::default(),
        None,
        |p| reports.push(p),
    )
    .await
    .unwrap();

    assert!(storage.do_i_have(0));
    assert!(!storage.do_i_have(1));
    assert!(storage.do_i_have(2));
    assert!(storage.do_i_have(3));
    assert_eq!(reports.len(), 4);
    assert_eq!(reports.last().copied(), Some(1.0));
    assert_eq!(storage.amount_left(), 16384);
}

#[tokio::test]
async fn test_startup_check_adopts_out_of_place_piece() {
    let fixture = Fixture::new(16384, 16384 * 3);
    let mut data = vec![0u8; 16384 * 2];
    data[..16384].copy_from_slice(fixture.piece(1));
    std::fs::write(fixture.path(), &data).unwrap();

    let mut storage = fixture.open(options(AllocType::Normal), None).await;
    assert!(storage.do_i_have(1));
    assert_eq!(storage.slot_of(1), Some(0));
    assert_eq!(storage.out_of_place(), 1);

    let read = storage.get_piece(1, 0, 16384).await.unwrap();
    assert_eq!(&read[..], fixture.piece(1));
    assert_eq!(storage.pickle().places, vec![(1, 0)]);
}

#[tokio::test]
async fn test_normal_allocation_fills_from_front() {
    let fixture = Fixture::new(16384, 16384 * 4);
    let unbuffered = StorageOptions {
        write_buffer_bytes: 0,
        ..options(AllocType::Normal)
    };
    let mut storage = fixture.open(unbuffered, None).await;

    fixture.download(&mut storage, 2, None).await;
    assert_eq!(storage.slot_of(2), Some(0));
    assert_eq!(std::fs::metadata(fixture.path()).unwrap().len(), 16384);

    fixture.download(&mut storage, 0, None).await;
    assert_eq!(storage.slot_of(0), Some(1));

    // Slot 2 belongs to piece 2, which moves home and frees slot 0.
    fixture.download(&mut storage, 1, None).await;
    assert_eq!(storage.slot_of(2), Some(2));
    assert_eq!(storage.slot_of(1), Some(0));

    fixture.download(&mut storage, 3, None).await;
    assert_eq!(storage.slot_of(3), Some(3));
    assert!(storage.is_complete());

    for piece in 0..4 {
        let data = storage.get_piece(piece, 0, 16384).await.unwrap();
        assert_eq!(&data[..], fixture.piece(piece), "piece {piece}");
    }
    assert_eq!(storage.out_of_place(), 2);
}

#[tokio::test]
async fn test_background_allocation_fills_holes() {
    let fixture = Fixture::new(16384, 16384 * 4);
    let mut storage = fixture.open(options(AllocType::Background), None).await;

    assert!(storage.allocate_step(16384).await.unwrap());
    assert_eq!(std::fs::metadata(fixture.path()).unwrap().len(), 16384);
    while storage.allocate_step(16384).await.unwrap() {}
    storage.flush().await.unwrap();
    assert_eq!(std::fs::metadata(fixture.path()).unwrap().len(), 16384 * 4);

    fixture.download(&mut storage, 3, None).await;
    assert!(storage.do_i_have(3));
}

#[tokio::test]
async fn test_preallocate_extends_files() {
    let fixture = Fixture::new(16384, 50000);
    let storage = fixture.open(options(AllocType::PreAllocate), None).await;
    assert_eq!(std::fs::metadata(fixture.path()).unwrap().len(), 50000);
    assert_eq!(storage.have_list().count(), 0);
}

#[tokio::test]
async fn test_double_check_detects_corruption() {
    let fixture = Fixture::new(16384, 32768);
    let options = StorageOptions {
        double_check: true,
        ..StorageOptions::default()
    };
    let mut storage = fixture.open(options, None).await;
    fixture.download(&mut storage, 1, None).await;
    storage.flush().await.unwrap();

    let offset = storage.stored_offset(1).unwrap() as usize;
    let mut data = std::fs::read(fixture.path()).unwrap();
    data[offset + 10] ^= 0xFF;
    std::fs::write(fixture.path(), &data).unwrap();

    assert!(matches!(
        storage.get_piece(1, 0, 100).await,
        Err(StorageError::HashMismatch(1))
    ));
    assert!(!storage.do_i_have(1));
    assert!(storage.is_unstarted(1));
    assert_accounting(&storage);
}

#[tokio::test]
async fn test_triple_check_verifies_from_disk() {
    let fixture = Fixture::new(16384, 32768);
    let options = StorageOptions {
        triple_check: true,
        ..StorageOptions::default()
    };
    let mut storage = fixture.open(options, None).await;
    fixture.download(&mut storage, 0, None).await;
    assert!(storage.do_i_have(0));

    let data = storage.get_piece(0, 0, 16384).await.unwrap();
    assert_eq!(&data[..], fixture.piece(0));
}

#[tokio::test]
async fn test_live_invalidate_ranges() {
    let fixture = Fixture::new(16384, 16384 * 6);
    let mut storage = fixture.open(StorageOptions::default(), None).await;
    for piece in 0..4 {
        fixture.download(&mut storage, piece, None).await;
    }
    storage.new_request(5).unwrap();
    storage.request_lost(5, 0, CHUNK);

    let dropped = storage.live_invalidate_ranges(&[0..2, 5..6]);
    assert_eq!(dropped, vec![0, 1]);
    assert!(!storage.do_i_have(0));
    assert!(storage.do_i_have(2));
    assert!(storage.is_unstarted(5));
    assert_eq!(storage.amount_left(), 4 * 16384);
    assert_accounting(&storage);

    fixture.download(&mut storage, 0, None).await;
    assert!(storage.do_i_have(0));
}

#[tokio::test]
async fn test_cloaked_have_list() {
    let fixture = Fixture::new(16384, 16384 * 8);
    std::fs::write(fixture.path(), &fixture.content).unwrap();
    let mut storage = fixture.open(StorageOptions::default(), None).await;
    assert!(storage.is_complete());

    let (masked, hidden) = storage.have_list_cloaked();
    assert!((2..=4).contains(&hidden.len()));
    assert_eq!(masked.count(), 8 - hidden.len());
    for piece in &hidden {
        assert!(!masked.has(*piece));
        assert!(storage.do_i_have(*piece));
    }
    assert_eq!(storage.have_list_cloaked(), (masked, hidden));
}

#[tokio::test]
async fn test_blocked_pieces_leave_accounting() {
    let fixture = Fixture::new(16384, 16384 * 3);
    let mut storage = fixture.open(StorageOptions::default(), None).await;

    assert!(storage.set_blocked(1, true));
    assert_eq!(storage.amount_desired(), 2 * 16384);
    assert!(matches!(storage.new_request(1), Err(StorageError::NoRequest(1))));
    assert!(!storage.do_i_have_requests(1));

    fixture.download(&mut storage, 0, None).await;
    fixture.download(&mut storage, 2, None).await;
    assert!(storage.is_complete());
    assert_accounting(&storage);

    assert!(storage.set_blocked(1, false));
    assert!(!storage.is_complete());
}

#[tokio::test]
async fn test_multifile_spans() {
    let temp = TempDir::new().unwrap();
    let files = vec![
        FileEntry::new(PathBuf::from("dir/a.bin"), 1000, 0),
        FileEntry::new(PathBuf::from("dir/b.bin"), 0, 1000),
        FileEntry::new(PathBuf::from("dir/c.bin"), 500, 1000),
    ];
    let spans = file_spans(&files, 900, 200);
    assert_eq!(
        spans,
        vec![
            FileSpan {
                file_index: 0,
                file_offset: 900,
                length: 100
            },
            FileSpan {
                file_index: 2,
                file_offset: 0,
                length: 100
            },
        ]
    );

    let mut backend = StorageBackend::open(temp.path().to_path_buf(), files)
        .await
        .unwrap();
    let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
    backend.write(900, &data).await.unwrap();
    backend.flush().await.unwrap();

    assert_eq!(backend.read(900, 200).await.unwrap().as_ref(), data.as_slice());
    assert_eq!(std::fs::metadata(temp.path().join("dir/c.bin")).unwrap().len(), 100);
    assert!(backend.read(1400, 50).await.is_err());
    assert_eq!(backend.read_padded(1400, 50).await.unwrap().as_ref(), &[0u8; 50]);
    assert!(backend.write(1450, &[0u8; 100]).await.is_err());
}

#[tokio::test]
async fn test_path_traversal_rejected() {
    let temp = TempDir::new().unwrap();
    let files = vec![FileEntry::new(PathBuf::from("../escape.bin"), 10, 0)];
    let result = StorageBackend::open(temp.path().to_path_buf(), files).await;
    assert!(matches!(result, Err(StorageError::PathTraversal(_))));
}
