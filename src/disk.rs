// Block devices.
//
// The cache talks to storage through one blocking, whole-block interface.
// MemDisk backs the tests (and can snapshot its image, which is exactly
// what a crash leaves behind: the bytes as of the last completed write).
// FileDisk backs the mkfs binary.

use crate::fs::BSIZE;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A device supporting synchronous reads and writes of one block.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]);
    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]);
}

/// In-memory disk image, shared by clone.
#[derive(Clone)]
pub struct MemDisk {
    image: Arc<Mutex<Vec<u8>>>,
}

impl MemDisk {
    /// A zeroed image of `size` blocks.
    pub fn new(size: u32) -> Self {
        Self {
            image: Arc::new(Mutex::new(vec![0; size as usize * BSIZE])),
        }
    }

    pub fn from_image(image: Vec<u8>) -> Self {
        assert!(image.len() % BSIZE == 0, "image not block aligned");
        Self {
            image: Arc::new(Mutex::new(image)),
        }
    }

    /// Copy of the image as of the last completed write. Mounting the
    /// snapshot is how the tests model a crash at that instant.
    pub fn snapshot(&self) -> MemDisk {
        let image = self.image.lock().unwrap().clone();
        MemDisk::from_image(image)
    }

    pub fn size(&self) -> u32 {
        (self.image.lock().unwrap().len() / BSIZE) as u32
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) {
        let image = self.image.lock().unwrap();
        let off = blockno as usize * BSIZE;
        assert!(off + BSIZE <= image.len(), "read past end of disk");
        buf.copy_from_slice(&image[off..off + BSIZE]);
    }

    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) {
        let mut image = self.image.lock().unwrap();
        let off = blockno as usize * BSIZE;
        assert!(off + BSIZE <= image.len(), "write past end of disk");
        image[off..off + BSIZE].copy_from_slice(buf);
    }
}

/// File-backed disk image.
pub struct FileDisk {
    file: Mutex<File>,
}

impl FileDisk {
    /// Create (or truncate) an image of `size` blocks.
    pub fn create<P: AsRef<Path>>(path: P, size: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64 * BSIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Open an existing image.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % BSIZE as u64 != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "image not block aligned",
            ));
        }
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))
            .expect("disk seek");
        file.read_exact(buf).expect("disk read");
    }

    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))
            .expect("disk seek");
        file.write_all(buf).expect("disk write");
        file.flush().expect("disk flush");
    }
}
