//! The I/O engine: a non-blocking submission front end driven from the CPU
//! thread, and a single worker thread that owns the partition manager, the
//! DVD image and the guest handle map.
//!
//! The CPU thread never blocks on the worker: submission and completion
//! polling use try-lock and fall back to a pending vector or a `pending`
//! status, so the emulated guest simply polls again. The worker suspends by
//! parking and is unparked on every submission and on shutdown.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, Thread};

use xstor_common::time::{fatx_timestamp, TimeSource};
use xstor_fatx::metadata::AccessCheckFlags;
use xstor_fatx::partition::InitError;
use xstor_fatx::{
    check_file_access, Dirent, FileAttributes, FindResult, FsError, PartitionManager, Status,
};
use xstor_xdvdfs::{XdvdfsError, XdvdfsImage};

use crate::files;
use crate::guest::GuestMemory;
use crate::path::{resolve_guest_path, ResolvedPath};
use crate::request::{
    Device, IoInfoBlock, IoRequest, PackedIoRequest, RequestFlags, RequestOp,
    PACKED_IO_REQUEST_SIZE,
};

#[derive(Debug, thiserror::Error)]
pub enum IoInitError {
    #[error(transparent)]
    Fatx(#[from] InitError),
    #[error(transparent)]
    Xdvdfs(#[from] XdvdfsError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared between the CPU-thread front end and the worker.
struct Shared {
    queue: Mutex<VecDeque<IoRequest>>,
    /// Requests the CPU thread could not enqueue because the worker held the
    /// queue lock. Only the CPU thread touches this, so the lock below is
    /// never contended.
    pending: Mutex<Vec<IoRequest>>,
    pending_packets: AtomicBool,
    completions: Mutex<HashMap<u32, IoInfoBlock>>,
    running: AtomicBool,
}

/// An entry of the guest handle map, owned by the worker.
enum HandleEntry {
    /// A FATX file backed by a real host file.
    HddFile {
        file: std::fs::File,
        partition_num: usize,
        tail: String,
        dirent: Dirent,
        dirent_offset: u64,
    },
    /// A device-level handle giving raw access to a whole partition.
    HddPartition { partition_num: usize },
    /// A file inside the DVD image.
    DvdFile { offset: u64, size: u32 },
}

/// Public face of the I/O pipeline.
pub struct IoEngine {
    shared: Arc<Shared>,
    guest: Arc<dyn GuestMemory>,
    worker: Option<JoinHandle<()>>,
    worker_thread: Thread,
    /// Completion block of the last status query; the matching info query
    /// reads it back.
    last_block: Mutex<IoInfoBlock>,
}

impl IoEngine {
    /// Brings up the virtual disk (and DVD image, when given) and spawns the
    /// worker. Partition state is created on the calling thread; the worker
    /// owns it exclusively from here on.
    pub fn init(
        base_dir: &Path,
        xiso_path: Option<&Path>,
        guest: Arc<dyn GuestMemory>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, IoInitError> {
        let manager = PartitionManager::init(base_dir)?;
        let dvd = match xiso_path {
            Some(path) => Some(XdvdfsImage::open(path)?),
            None => None,
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(Vec::new()),
            pending_packets: AtomicBool::new(false),
            completions: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        });

        let worker = Worker {
            shared: shared.clone(),
            guest: guest.clone(),
            clock,
            manager,
            dvd,
            handles: HashMap::new(),
            io_buffer: Vec::new(),
        };
        let handle = std::thread::Builder::new()
            .name("io".into())
            .spawn(move || worker.run())?;
        let worker_thread = handle.thread().clone();

        Ok(Self {
            shared,
            guest,
            worker: Some(handle),
            worker_thread,
            last_block: Mutex::new(IoInfoBlock::error(Status::Pending)),
        })
    }

    /// Reads a request descriptor out of guest memory and enqueues it.
    /// Called from the emulated CPU thread; never blocks. If the worker is
    /// holding the queue lock the request is buffered and
    /// [`Self::flush_pending_packets`] retries the transfer later.
    pub fn submit_packet(&self, addr: u32) {
        let mut raw = [0u8; PACKED_IO_REQUEST_SIZE];
        self.guest.read_block(addr, &mut raw);
        let packed: PackedIoRequest = *bytemuck::from_bytes(&raw);
        let mut request = IoRequest::from_packed(packed);

        if request.is_open_or_create() {
            let mut path = vec![0u8; request.size as usize];
            self.guest.read_block(request.path_address(), &mut path);
            while path.last() == Some(&0) {
                path.pop();
            }
            request.path = Some(String::from_utf8_lossy(&path).into_owned());
        }

        match self.shared.queue.try_lock() {
            Ok(mut queue) => {
                queue.push_back(request);
                drop(queue);
                self.worker_thread.unpark();
            }
            Err(_) => {
                self.shared.pending.lock().unwrap().push(request);
                self.shared.pending_packets.store(true, Ordering::Release);
            }
        }
    }

    /// True when buffered requests are waiting for a flush.
    pub fn pending_packets(&self) -> bool {
        self.shared.pending_packets.load(Ordering::Acquire)
    }

    /// Retries moving buffered requests into the queue. Non-blocking; a
    /// failed attempt leaves the pending flag set for the next call.
    pub fn flush_pending_packets(&self) {
        if !self.shared.pending_packets.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut queue) = self.shared.queue.try_lock() {
            let mut pending = self.shared.pending.lock().unwrap();
            queue.extend(pending.drain(..));
            self.shared.pending_packets.store(false, Ordering::Release);
            drop(pending);
            drop(queue);
            self.worker_thread.unpark();
        }
    }

    /// Polls a completion. A status query (`want_status`) consumes the
    /// completion block and latches it; the matching info query reads the
    /// latched block back. Returns `pending` when the worker currently holds
    /// the completion map.
    pub fn query_packet(&self, id: u32, want_status: bool) -> u32 {
        let mut block = self.last_block.lock().unwrap();
        if want_status {
            block.status = Status::Pending;
            if let Ok(mut completions) = self.shared.completions.try_lock() {
                if let Some(found) = completions.remove(&id) {
                    *block = found;
                }
            }
            block.status as u32
        } else {
            block.info
        }
    }

    /// Signals the worker to exit and waits for the acknowledgement. The
    /// worker clears its state and flushes every healthy partition's user
    /// data area before exiting.
    pub fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.running.store(false, Ordering::Release);
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    shared: Arc<Shared>,
    guest: Arc<dyn GuestMemory>,
    clock: Arc<dyn TimeSource>,
    manager: PartitionManager,
    dvd: Option<XdvdfsImage>,
    handles: HashMap<u32, HandleEntry>,
    io_buffer: Vec<u8>,
}

impl Worker {
    fn run(mut self) {
        loop {
            if !self.shared.running.load(Ordering::Acquire) {
                self.handles.clear();
                self.shared.queue.lock().unwrap().clear();
                self.shared.completions.lock().unwrap().clear();
                self.shared.pending.lock().unwrap().clear();
                self.shared.pending_packets.store(false, Ordering::Release);
                self.manager.flush();
                return;
            }

            let request = self.shared.queue.lock().unwrap().pop_front();
            let Some(request) = request else {
                std::thread::park();
                continue;
            };

            let block = self.dispatch(&request);
            self.shared.completions.lock().unwrap().insert(request.id, block);
        }
    }

    fn dispatch(&mut self, request: &IoRequest) -> IoInfoBlock {
        if request.is_open_or_create() {
            let Some(path) = request.path.as_deref() else {
                return IoInfoBlock::error(Status::Error);
            };
            let Some(resolved) = resolve_guest_path(path, self.manager.base_dir()) else {
                return IoInfoBlock::error(Status::Error);
            };
            return match resolved.device {
                Device::Dvd => self.open_dvd(request, &resolved),
                Device::Hdd => self.open_hdd(request, &resolved),
            };
        }

        let handle = request.source_handle();
        if !self.handles.contains_key(&handle) {
            log::warn!("Xbox handle {handle} not found");
            return IoInfoBlock::error(Status::Error);
        }

        match request.op() {
            Some(RequestOp::Close) => {
                self.handles.remove(&handle);
                IoInfoBlock::success(0)
            }
            Some(RequestOp::Read) => self.do_read(request, handle),
            Some(RequestOp::Write) => self.do_write(request, handle),
            _ => {
                // TODO: wire up the remove request once the kernel submits it
                log::warn!("Unknown I/O request of type {:#x}", request.ty);
                IoInfoBlock::success(0)
            }
        }
    }

    fn open_dvd(&mut self, request: &IoRequest, resolved: &ResolvedPath) -> IoInfoBlock {
        let Some(dvd) = self.dvd.as_mut() else {
            return IoInfoBlock::error(Status::Error);
        };
        let Some(info) = dvd.search_file(&resolved.tail) else {
            return IoInfoBlock::error(Status::NameNotFound);
        };
        if request.flags().contains(RequestFlags::DIRECTORY) {
            if !info.is_directory {
                return IoInfoBlock::error(Status::NotADirectory);
            }
            // Opening a DVD directory: nothing to do.
            return IoInfoBlock::success(0);
        }
        if info.is_directory {
            return IoInfoBlock::error(Status::IsADirectory);
        }
        self.handles.insert(
            request.target_handle(),
            HandleEntry::DvdFile { offset: info.offset, size: info.size },
        );
        IoInfoBlock::success(0)
    }

    fn open_hdd(&mut self, request: &IoRequest, resolved: &ResolvedPath) -> IoInfoBlock {
        let is_create = request.op() == Some(RequestOp::Create);
        let flags = request.flags();

        if resolved.partition_num == 0 || resolved.tail.is_empty() {
            if flags.contains(RequestFlags::DIRECTORY) {
                // Opening the partition root as a directory: nothing to do.
                return IoInfoBlock::success(0);
            }
            // A device-level handle: read/write on it is raw partition I/O.
            self.handles.insert(
                request.target_handle(),
                HandleEntry::HddPartition { partition_num: resolved.partition_num },
            );
            return IoInfoBlock::success(0);
        }

        let timestamp = fatx_timestamp(self.clock.now_us());
        let partition = match self.manager.partition(resolved.partition_num) {
            Ok(partition) => partition,
            Err(err) => return IoInfoBlock::error(err.status()),
        };

        match partition.find_dirent(&resolved.fatx_path) {
            Ok(FindResult::RootDir) => IoInfoBlock::success(0),
            Ok(FindResult::Found { mut dirent, dirent_offset }) => {
                let check_flags = if flags.contains(RequestFlags::DIRECTORY) {
                    AccessCheckFlags::MUST_BE_A_DIR
                } else {
                    AccessCheckFlags::MUST_NOT_BE_A_DIR
                };
                if let Err(err) =
                    check_file_access(0, 0, dirent.file_attributes(), is_create, check_flags)
                {
                    return IoInfoBlock::error(err.status());
                }
                if flags.contains(RequestFlags::DIRECTORY) {
                    // The directory already exists; open and create-if both
                    // succeed with nothing to do.
                    return IoInfoBlock::success(0);
                }
                if is_create && !flags.contains(RequestFlags::ALWAYS) {
                    // FILE_CREATE on an existing file
                    return IoInfoBlock::error(Status::Error);
                }
                // FILE_SUPERSEDE, FILE_OVERWRITE and FILE_OVERWRITE_IF all
                // truncate the existing file.
                let truncate = (is_create && flags.contains(RequestFlags::ALWAYS))
                    || (!is_create && flags.contains(RequestFlags::TRUNCATE));
                if truncate {
                    if let Err(err) =
                        partition.overwrite_dirent_for_file(&mut dirent, 0, &resolved.tail)
                    {
                        return IoInfoBlock::error(err.status());
                    }
                    dirent.last_write_time = timestamp;
                    if let Err(err) = partition.flush_dirent_for_file(&dirent, dirent_offset) {
                        return IoInfoBlock::error(err.status());
                    }
                    let Some(file) = files::create_file(&resolved.host_path) else {
                        return IoInfoBlock::error(Status::Error);
                    };
                    self.insert_file_handle(request, resolved, file, dirent, dirent_offset);
                    return IoInfoBlock::success(0);
                }
                let Some(file) = files::open_file(&resolved.host_path) else {
                    return IoInfoBlock::error(Status::Error);
                };
                self.insert_file_handle(request, resolved, file, dirent, dirent_offset);
                IoInfoBlock::success(0)
            }
            Err(FsError::NameNotFound) => {
                // FILE_CREATE, FILE_SUPERSEDE and FILE_OVERWRITE_IF create
                // the missing object; the plain open dispositions fail.
                let creates = is_create
                    || (flags.contains(RequestFlags::TRUNCATE)
                        && flags.contains(RequestFlags::ALWAYS));
                if !creates {
                    return IoInfoBlock::error(Status::NameNotFound);
                }
                let name = resolved.tail.rsplit('/').next().unwrap_or(&resolved.tail);
                let attributes = if flags.contains(RequestFlags::DIRECTORY) {
                    FileAttributes::DIRECTORY
                } else {
                    FileAttributes::empty()
                };
                let mut dirent = match Dirent::new(name, attributes, 0, timestamp) {
                    Ok(dirent) => dirent,
                    Err(err) => return IoInfoBlock::error(err.status()),
                };
                if let Err(err) = partition.create_dirent_for_file(&mut dirent, &resolved.tail) {
                    return IoInfoBlock::error(err.status());
                }
                let dirent_offset = partition.last_free_dirent_offset();
                if flags.contains(RequestFlags::DIRECTORY) {
                    if !files::create_directory(&resolved.host_path) {
                        return IoInfoBlock::error(Status::Error);
                    }
                    return IoInfoBlock::success(0);
                }
                let Some(file) = files::create_file(&resolved.host_path) else {
                    return IoInfoBlock::error(Status::Error);
                };
                self.insert_file_handle(request, resolved, file, dirent, dirent_offset);
                IoInfoBlock::success(0)
            }
            Err(err) => IoInfoBlock::error(err.status()),
        }
    }

    fn insert_file_handle(
        &mut self,
        request: &IoRequest,
        resolved: &ResolvedPath,
        file: std::fs::File,
        dirent: Dirent,
        dirent_offset: u64,
    ) {
        let previous = self.handles.insert(
            request.target_handle(),
            HandleEntry::HddFile {
                file,
                partition_num: resolved.partition_num,
                tail: resolved.tail.clone(),
                dirent,
                dirent_offset,
            },
        );
        if previous.is_some() {
            log::warn!("Guest reused handle {} without closing it", request.target_handle());
        }
    }

    fn do_read(&mut self, request: &IoRequest, handle: u32) -> IoInfoBlock {
        let size = request.size as usize;
        if self.io_buffer.len() < size {
            self.io_buffer.resize(size, 0);
        }

        match self.handles.get_mut(&handle).unwrap() {
            HandleEntry::HddFile { file, .. } => {
                if file.seek(SeekFrom::Start(request.offset as u64)).is_err() {
                    return IoInfoBlock::error(Status::Error);
                }
                let mut filled = 0;
                while filled < size {
                    match file.read(&mut self.io_buffer[filled..size]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(_) => return IoInfoBlock::error(Status::Error),
                    }
                }
                self.guest.write_block(request.data_address(), &self.io_buffer[..filled]);
                IoInfoBlock::success(filled as u32)
            }
            HandleEntry::HddPartition { partition_num } => {
                let num = *partition_num;
                match self.manager.read_raw_partition(
                    num,
                    request.offset as u64,
                    &mut self.io_buffer[..size],
                ) {
                    Ok(()) => {
                        self.guest.write_block(request.data_address(), &self.io_buffer[..size]);
                        IoInfoBlock::success(size as u32)
                    }
                    Err(err) => IoInfoBlock::error(err.status()),
                }
            }
            HandleEntry::DvdFile { offset, size: file_size } => {
                let base = *offset;
                let available = (*file_size as u64)
                    .saturating_sub(request.offset as u64)
                    .min(size as u64) as usize;
                let Some(dvd) = self.dvd.as_mut() else {
                    return IoInfoBlock::error(Status::Error);
                };
                match dvd.read_at(base + request.offset as u64, &mut self.io_buffer[..available]) {
                    Ok(n) => {
                        self.guest.write_block(request.data_address(), &self.io_buffer[..n]);
                        IoInfoBlock::success(n as u32)
                    }
                    Err(_) => IoInfoBlock::error(Status::Error),
                }
            }
        }
    }

    fn do_write(&mut self, request: &IoRequest, handle: u32) -> IoInfoBlock {
        let size = request.size as usize;
        if self.io_buffer.len() < size {
            self.io_buffer.resize(size, 0);
        }
        self.guest.read_block(request.data_address(), &mut self.io_buffer[..size]);
        let timestamp = fatx_timestamp(self.clock.now_us());

        match self.handles.get_mut(&handle).unwrap() {
            HandleEntry::HddFile { file, partition_num, tail, dirent, dirent_offset } => {
                if file
                    .seek(SeekFrom::Start(request.offset as u64))
                    .and_then(|_| file.write_all(&self.io_buffer[..size]))
                    .is_err()
                {
                    return IoInfoBlock::error(Status::Error);
                }

                // Keep the FATX metadata in step with the host file: extend
                // the cluster chain past the old end of data and persist the
                // new size and write time.
                let partition = match self.manager.partition(*partition_num) {
                    Ok(partition) => partition,
                    Err(err) => return IoInfoBlock::error(err.status()),
                };
                if let Err(err) =
                    partition.append_clusters_to_file(dirent, request.offset, request.size, tail)
                {
                    return IoInfoBlock::error(err.status());
                }
                let end = request.offset as u64 + request.size as u64;
                if end > dirent.size as u64 {
                    dirent.size = end as u32;
                }
                dirent.last_write_time = timestamp;
                if let Err(err) = partition.flush_dirent_for_file(dirent, *dirent_offset) {
                    return IoInfoBlock::error(err.status());
                }
                IoInfoBlock::success(0)
            }
            HandleEntry::HddPartition { partition_num } => {
                let num = *partition_num;
                match self.manager.write_raw_partition(
                    num,
                    request.offset as u64,
                    &self.io_buffer[..size],
                ) {
                    Ok(()) => IoInfoBlock::success(0),
                    Err(err) => IoInfoBlock::error(err.status()),
                }
            }
            HandleEntry::DvdFile { .. } => {
                // The DVD is read-only.
                IoInfoBlock::error(Status::Failed)
            }
        }
    }
}
