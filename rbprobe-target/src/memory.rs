//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};

/// C文字列を読み取るときのチャンクサイズ
const CSTRING_CHUNK: usize = 64;

/// メモリマッピング情報
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub offset: usize,
    pub path: Option<String>,
}

impl MemoryMapping {
    /// /proc/pid/maps の1行をパースする
    ///
    /// フォーマット: "address perms offset dev inode pathname"
    /// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /usr/bin/ruby"
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Ok(None);
        }

        let Some((start, end)) = parts[0].split_once('-') else {
            return Ok(None);
        };

        let start = usize::from_str_radix(start, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse start address: {}", e))?;
        let end = usize::from_str_radix(end, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse end address: {}", e))?;
        let offset = usize::from_str_radix(parts[2], 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse segment offset: {}", e))?;

        let perms = parts[1].as_bytes();
        Ok(Some(Self {
            start,
            end,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset,
            path: parts.get(5).map(|p| p.to_string()),
        }))
    }

    /// アドレスがこのマッピング内にあるか
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
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
    pub fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    // EIO (errno 5): ptraceにフォールバック
                    if io_err.raw_os_error() == Some(libc::EIO) {
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr as u64))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// メモリにデータを書き込む
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリに書き込みます。
    /// ptraceでアタッチ済みであれば、読み取り専用ページ（テキスト領域）にも書き込めます。
    pub fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr as u64))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;

        file.write_all(data)
            .map_err(|e| anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e))?;

        Ok(())
    }

    /// u64値を読み取る（リトルエンディアン）
    pub fn read_u64(&self, addr: usize) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        let array: [u8; 8] = bytes.as_slice().try_into()
            .map_err(|_| anyhow::anyhow!("Short read at 0x{:x}", addr))?;
        Ok(u64::from_le_bytes(array))
    }

    /// u64値を書き込む（リトルエンディアン）
    pub fn write_u64(&self, addr: usize, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// u8値を読み取る
    pub fn read_u8(&self, addr: usize) -> Result<u8> {
        let bytes = self.read(addr, 1)?;
        bytes.first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Cannot read u8 at 0x{:x}", addr))
    }

    /// u8値を書き込む
    pub fn write_u8(&self, addr: usize, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// NUL終端のC文字列を読み取る
    ///
    /// `max_len` バイトを超える場合はそこで打ち切ります。
    /// ページ境界をまたぐ読み取りが失敗しないよう、小さなチャンク単位で読み進めます。
    pub fn read_c_string(&self, addr: usize, max_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut cursor = addr;

        while out.len() < max_len {
            let chunk = CSTRING_CHUNK.min(max_len - out.len());
            let bytes = self.read(cursor, chunk)?;
            if let Some(nul) = bytes.iter().position(|&b| b == 0) {
                out.extend_from_slice(&bytes[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&bytes);
            cursor += chunk;
        }

        Ok(out)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            if let Some(mapping) = MemoryMapping::parse(&line?)? {
                mappings.push(mapping);
            }
        }

        Ok(mappings)
    }

    /// 実行可能ファイルのベースアドレスを取得する
    ///
    /// PIE（Position Independent Executable）の場合、実行時にランダムなアドレスにロードされます。
    /// このメソッドは、実行可能ファイルの最初の実行可能セグメントのベースアドレスを返します。
    pub fn get_base_address(&self) -> Result<usize> {
        self.get_mappings()?
            .iter()
            .find(|m| m.executable)
            // シンボルオフセットはファイル内のオフセットなので、セグメントのファイルオフセットを引く
            .map(|m| m.start - m.offset)
            .ok_or_else(|| anyhow::anyhow!("Could not find executable segment in memory mappings"))
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    pub fn read_via_ptrace(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr)
                .map_err(|e| anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr + offset, e))?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        data.truncate(size);
        Ok(data)
    }
}
