//! End-to-end request pipeline tests: descriptors submitted through mock
//! guest memory, completions polled back the way the emulated kernel does.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use xstor_common::time::HostClock;
use xstor_fatx::Status;
use xstor_io::{GuestMemory, IoEngine, PackedIoRequest};

struct MockGuest(Mutex<Vec<u8>>);

impl MockGuest {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self(Mutex::new(vec![0; size])))
    }

    fn poke(&self, addr: u32, bytes: &[u8]) {
        let mut mem = self.0.lock().unwrap();
        mem[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
    }

    fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        let mem = self.0.lock().unwrap();
        mem[addr as usize..addr as usize + len].to_vec()
    }
}

impl GuestMemory for MockGuest {
    fn read_block(&self, addr: u32, dst: &mut [u8]) {
        let mem = self.0.lock().unwrap();
        dst.copy_from_slice(&mem[addr as usize..addr as usize + dst.len()]);
    }

    fn write_block(&self, addr: u32, src: &[u8]) {
        let mut mem = self.0.lock().unwrap();
        mem[addr as usize..addr as usize + src.len()].copy_from_slice(src);
    }
}

fn ty(op: u32, device: u32, flags: u32) -> u32 {
    (op << 16) | (device << 12) | flags
}

const DESC_ADDR: u32 = 0x100;
const PATH_ADDR: u32 = 0x1000;
const DATA_ADDR: u32 = 0x2000;

fn submit_path_request(
    engine: &IoEngine,
    guest: &MockGuest,
    id: u32,
    ty: u32,
    handle: u32,
    path: &str,
) -> (u32, u32) {
    guest.poke(PATH_ADDR, path.as_bytes());
    let request = PackedIoRequest {
        id,
        ty,
        offset: 0,
        size: path.len() as u32,
        handle_or_address: handle,
        handle_or_path: PATH_ADDR,
    };
    submit_and_wait(engine, guest, request)
}

fn submit_and_wait(engine: &IoEngine, guest: &MockGuest, request: PackedIoRequest) -> (u32, u32) {
    guest.poke(DESC_ADDR, bytemuck::bytes_of(&request));
    engine.submit_packet(DESC_ADDR);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        engine.flush_pending_packets();
        let status = engine.query_packet(request.id, true);
        if status != Status::Pending as u32 {
            let info = engine.query_packet(request.id, false);
            return (status, info);
        }
        let request_id = request.id;
        assert!(Instant::now() < deadline, "request {} timed out", request_id);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn create_write_read_close_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let guest = MockGuest::new(64 * 1024);
    let engine =
        IoEngine::init(dir.path(), None, guest.clone(), Arc::new(HostClock)).unwrap();

    // Create \Harddisk0\Partition2\a.bin with guest handle 0x40.
    let (status, _) = submit_path_request(
        &engine,
        &guest,
        1,
        ty(2, 1, 0),
        0x40,
        "\\Harddisk0\\Partition2\\a.bin",
    );
    assert_eq!(status, Status::Success as u32);

    // Write four bytes at offset 0.
    guest.poke(DATA_ADDR, &[0x11, 0x22, 0x33, 0x44]);
    let (status, _) = submit_and_wait(&engine, &guest, PackedIoRequest {
        id: 2,
        ty: ty(6, 1, 0),
        offset: 0,
        size: 4,
        handle_or_address: DATA_ADDR,
        handle_or_path: 0x40,
    });
    assert_eq!(status, Status::Success as u32);

    // Read them back into a different guest buffer.
    let (status, info) = submit_and_wait(&engine, &guest, PackedIoRequest {
        id: 3,
        ty: ty(5, 1, 0),
        offset: 0,
        size: 4,
        handle_or_address: DATA_ADDR + 0x100,
        handle_or_path: 0x40,
    });
    assert_eq!(status, Status::Success as u32);
    assert_eq!(info, 4);
    assert_eq!(guest.peek(DATA_ADDR + 0x100, 4), vec![0x11, 0x22, 0x33, 0x44]);

    // Close the handle; a second close fails because it is gone.
    let close = PackedIoRequest {
        id: 4,
        ty: ty(4, 1, 0),
        offset: 0,
        size: 0,
        handle_or_address: 0,
        handle_or_path: 0x40,
    };
    let (status, _) = submit_and_wait(&engine, &guest, close);
    assert_eq!(status, Status::Success as u32);
    let (status, _) = submit_and_wait(&engine, &guest, PackedIoRequest { id: 5, ..close });
    assert_eq!(status, Status::Error as u32);

    drop(engine);

    // The contents live in a real host file.
    let contents = std::fs::read(dir.path().join("Harddisk/Partition2/a.bin")).unwrap();
    assert_eq!(contents, vec![0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn files_survive_a_clean_restart() {
    let dir = tempfile::tempdir().unwrap();
    let guest = MockGuest::new(64 * 1024);

    {
        let engine =
            IoEngine::init(dir.path(), None, guest.clone(), Arc::new(HostClock)).unwrap();
        let (status, _) = submit_path_request(
            &engine,
            &guest,
            1,
            ty(2, 1, 0),
            0x40,
            "\\Harddisk0\\Partition3\\save.bin",
        );
        assert_eq!(status, Status::Success as u32);
        guest.poke(DATA_ADDR, b"progress");
        let (status, _) = submit_and_wait(&engine, &guest, PackedIoRequest {
            id: 2,
            ty: ty(6, 1, 0),
            offset: 0,
            size: 8,
            handle_or_address: DATA_ADDR,
            handle_or_path: 0x40,
        });
        assert_eq!(status, Status::Success as u32);
        // Dropping the engine performs the clean shutdown flush.
    }

    let engine = IoEngine::init(dir.path(), None, guest.clone(), Arc::new(HostClock)).unwrap();
    // FILE_OPEN of the existing file succeeds after the restart.
    let (status, _) = submit_path_request(
        &engine,
        &guest,
        3,
        ty(1, 1, 0),
        0x41,
        "\\Harddisk0\\Partition3\\save.bin",
    );
    assert_eq!(status, Status::Success as u32);

    let (status, info) = submit_and_wait(&engine, &guest, PackedIoRequest {
        id: 4,
        ty: ty(5, 1, 0),
        offset: 0,
        size: 8,
        handle_or_address: DATA_ADDR + 0x200,
        handle_or_path: 0x41,
    });
    assert_eq!(status, Status::Success as u32);
    assert_eq!(info, 8);
    assert_eq!(guest.peek(DATA_ADDR + 0x200, 8), b"progress".to_vec());
}

#[test]
fn plain_open_of_a_missing_file_reports_name_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let guest = MockGuest::new(64 * 1024);
    let engine = IoEngine::init(dir.path(), None, guest.clone(), Arc::new(HostClock)).unwrap();

    let (status, _) = submit_path_request(
        &engine,
        &guest,
        1,
        ty(1, 1, 0),
        0x40,
        "\\Harddisk0\\Partition2\\nope.bin",
    );
    assert_eq!(status, Status::NameNotFound as u32);
}

#[test]
fn directories_are_created_and_protect_their_children() {
    let dir = tempfile::tempdir().unwrap();
    let guest = MockGuest::new(64 * 1024);
    let engine = IoEngine::init(dir.path(), None, guest.clone(), Arc::new(HostClock)).unwrap();

    // Create \Harddisk0\Partition2\saves as a directory.
    let (status, _) = submit_path_request(
        &engine,
        &guest,
        1,
        ty(2, 1, 1),
        0x40,
        "\\Harddisk0\\Partition2\\saves",
    );
    assert_eq!(status, Status::Success as u32);
    assert!(dir.path().join("Harddisk/Partition2/saves").is_dir());

    // A file inside it.
    let (status, _) = submit_path_request(
        &engine,
        &guest,
        2,
        ty(2, 1, 0),
        0x41,
        "\\Harddisk0\\Partition2\\saves\\slot0.bin",
    );
    assert_eq!(status, Status::Success as u32);
    assert!(dir.path().join("Harddisk/Partition2/saves/slot0.bin").is_file());

    // Opening the directory as a file is refused by the access check.
    let (status, _) = submit_path_request(
        &engine,
        &guest,
        3,
        ty(1, 1, 0),
        0x42,
        "\\Harddisk0\\Partition2\\saves",
    );
    assert_eq!(status, Status::IsADirectory as u32);
}

#[test]
fn device_handles_give_raw_partition_access() {
    let dir = tempfile::tempdir().unwrap();
    let guest = MockGuest::new(64 * 1024);
    let engine = IoEngine::init(dir.path(), None, guest.clone(), Arc::new(HostClock)).unwrap();

    let (status, _) = submit_path_request(
        &engine,
        &guest,
        1,
        ty(1, 1, 0),
        0x40,
        "\\Harddisk0\\Partition2",
    );
    assert_eq!(status, Status::Success as u32);

    // The first bytes of the partition are the FATX superblock signature.
    let (status, info) = submit_and_wait(&engine, &guest, PackedIoRequest {
        id: 2,
        ty: ty(5, 1, 0),
        offset: 0,
        size: 4,
        handle_or_address: DATA_ADDR,
        handle_or_path: 0x40,
    });
    assert_eq!(status, Status::Success as u32);
    assert_eq!(info, 4);
    assert_eq!(guest.peek(DATA_ADDR, 4), b"FATX".to_vec());

    // Partition 0 exposes the config area.
    let (status, _) = submit_path_request(
        &engine,
        &guest,
        3,
        ty(1, 1, 0),
        0x41,
        "\\Harddisk0\\Partition0",
    );
    assert_eq!(status, Status::Success as u32);
    let (status, _) = submit_and_wait(&engine, &guest, PackedIoRequest {
        id: 4,
        ty: ty(5, 1, 0),
        offset: 0,
        size: 16,
        handle_or_address: DATA_ADDR + 0x40,
        handle_or_path: 0x41,
    });
    assert_eq!(status, Status::Success as u32);
    assert_eq!(guest.peek(DATA_ADDR + 0x40, 16), b"****PARTINFO****".to_vec());
}

#[test]
fn remove_requests_are_acknowledged_but_unimplemented() {
    let dir = tempfile::tempdir().unwrap();
    let guest = MockGuest::new(64 * 1024);
    let engine = IoEngine::init(dir.path(), None, guest.clone(), Arc::new(HostClock)).unwrap();

    let (status, _) = submit_path_request(
        &engine,
        &guest,
        1,
        ty(2, 1, 0),
        0x40,
        "\\Harddisk0\\Partition2\\x.bin",
    );
    assert_eq!(status, Status::Success as u32);

    let (status, _) = submit_and_wait(&engine, &guest, PackedIoRequest {
        id: 2,
        ty: ty(3, 1, 0),
        offset: 0,
        size: 0,
        handle_or_address: 0,
        handle_or_path: 0x40,
    });
    assert_eq!(status, Status::Success as u32);
}

/// Builds a minimal scrubbed XISO with one file at sector 40.
fn build_xiso(dir: &std::path::Path) -> std::path::PathBuf {
    let mut image = vec![0u8; 41 * 2048];
    // Volume descriptor at sector 32.
    let desc = 32 * 2048;
    image[desc..desc + 20].copy_from_slice(b"MICROSOFT*XBOX*MEDIA");
    image[desc + 20..desc + 24].copy_from_slice(&33u32.to_le_bytes()); // root sector
    image[desc + 24..desc + 28].copy_from_slice(&2048u32.to_le_bytes()); // root size
    image[desc + 2028..desc + 2048].copy_from_slice(b"MICROSOFT*XBOX*MEDIA");
    // Root directory with a single dirent for game.xbe.
    let root = 33 * 2048;
    image[root..root + 2].copy_from_slice(&0u16.to_le_bytes()); // left
    image[root + 2..root + 4].copy_from_slice(&0u16.to_le_bytes()); // right
    image[root + 4..root + 8].copy_from_slice(&40u32.to_le_bytes()); // file sector
    image[root + 8..root + 12].copy_from_slice(&12u32.to_le_bytes()); // file size
    image[root + 12] = 0; // attributes
    image[root + 13] = 8; // name length
    image[root + 14..root + 22].copy_from_slice(b"game.xbe");
    // File contents at sector 40.
    image[40 * 2048..40 * 2048 + 12].copy_from_slice(b"XBOXGAMEDATA");

    let path = dir.join("game.iso");
    std::fs::write(&path, &image).unwrap();
    path
}

#[test]
fn dvd_files_are_served_from_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let xiso = build_xiso(dir.path());
    let guest = MockGuest::new(64 * 1024);
    let engine =
        IoEngine::init(dir.path(), Some(xiso.as_path()), guest.clone(), Arc::new(HostClock))
            .unwrap();

    let (status, _) =
        submit_path_request(&engine, &guest, 1, ty(1, 0, 0), 0x40, "\\CdRom0\\GAME.XBE");
    assert_eq!(status, Status::Success as u32);

    // Reads clamp to the file size.
    let (status, info) = submit_and_wait(&engine, &guest, PackedIoRequest {
        id: 2,
        ty: ty(5, 0, 0),
        offset: 0,
        size: 64,
        handle_or_address: DATA_ADDR,
        handle_or_path: 0x40,
    });
    assert_eq!(status, Status::Success as u32);
    assert_eq!(info, 12);
    assert_eq!(guest.peek(DATA_ADDR, 12), b"XBOXGAMEDATA".to_vec());

    // The DVD is read-only.
    let (status, _) = submit_and_wait(&engine, &guest, PackedIoRequest {
        id: 3,
        ty: ty(6, 0, 0),
        offset: 0,
        size: 4,
        handle_or_address: DATA_ADDR,
        handle_or_path: 0x40,
    });
    assert_eq!(status, Status::Failed as u32);

    let (status, _) =
        submit_path_request(&engine, &guest, 4, ty(1, 0, 0), 0x41, "\\CdRom0\\missing.xbe");
    assert_eq!(status, Status::NameNotFound as u32);
}
