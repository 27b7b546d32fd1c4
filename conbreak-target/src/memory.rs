//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};
use std::path::Path;

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub executable: bool,
    /// マッピング元ファイル内のオフセット
    pub offset: u64,
    /// マッピング元ファイルのパス（匿名マッピングは None）
    pub path: Option<String>,
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// メモリにデータを書き込む
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリに書き込みます。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;

        file.write_all(data)
            .map_err(|e| anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e))?;

        Ok(())
    }

    /// u8値を読み取る
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        let bytes = self.read(addr, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Cannot read u8 at 0x{:x}", addr))
    }

    /// u8値を書き込む
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;

        let mut mappings = Vec::new();
        for line in BufReader::new(file).lines() {
            if let Some(mapping) = parse_maps_line(&line?) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// 実行可能ファイルのロードバイアスを取得する
    ///
    /// PIE（Position Independent Executable）の場合、実行時にランダムなアドレスにロードされます。
    /// ファイル先頭（オフセット0）をマップしている領域の開始アドレスを返します。
    pub fn load_bias(&self, binary: &Path) -> Result<u64> {
        let wanted = binary.canonicalize().unwrap_or_else(|_| binary.to_path_buf());
        self.get_mappings()?
            .into_iter()
            .find(|m| m.offset == 0 && m.path.as_deref().is_some_and(|p| Path::new(p) == wanted))
            .map(|m| m.start)
            .ok_or_else(|| anyhow::anyhow!("Could not find {:?} in memory mappings", wanted))
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset as u64) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr + offset as u64, e)
            })?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }
}

/// `/proc/pid/maps` の1行をパースする
///
/// フォーマット: "address perms offset dev inode pathname"
fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next().map(str::to_string);

    Some(MemoryMapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        executable: perms.chars().nth(2) == Some('x'),
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps_line() {
        let mapping = parse_maps_line(
            "555555554000-555555556000 r-xp 00001000 08:01 123456 /usr/bin/racy_counter",
        )
        .unwrap();
        assert_eq!(mapping.start, 0x5555_5555_4000);
        assert_eq!(mapping.end, 0x5555_5555_6000);
        assert!(mapping.executable);
        assert_eq!(mapping.offset, 0x1000);
        assert_eq!(mapping.path.as_deref(), Some("/usr/bin/racy_counter"));

        let anon = parse_maps_line("7ffff7fc1000-7ffff7fc5000 rw-p 00000000 00:00 0").unwrap();
        assert!(!anon.executable);
        assert_eq!(anon.path, None);

        assert!(parse_maps_line("garbage").is_none());
    }

    #[test]
    fn test_read_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let memory = Memory::new(std::process::id() as i32);
        let bytes = memory
            .read(&value as *const u64 as u64, 8)
            .expect("reading own memory should work");
        assert_eq!(bytes, value.to_le_bytes());
    }
}
