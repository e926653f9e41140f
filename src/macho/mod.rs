//! Shared Mach-O reading/writing layer consumed by every context: header,
//! segment, section, symbol-table, and relocation iterators, plus the
//! write-side primitives (`MachoExpandFile`, `MergeSegments`, load-command
//! rewriting) the prelinked/KC contexts need and that a pure parser like
//! `goblin` doesn't provide.

pub mod consts;
pub mod fixups;
pub mod linkedit;
pub mod linker;
pub mod raw;
pub mod reloc;
pub mod symbol;
pub mod vtable;

use crate::error::{KextError, Result};
use consts::*;
use raw::*;
use scroll::{Pread, Pwrite, LE};

/// One load command as found while walking the header.
#[derive(Debug, Clone)]
pub struct LoadCommandEntry {
    pub offset: usize,
    pub cmd: u32,
    pub cmd_size: u32,
}

/// A parsed `__{SEGMENT}_64` command plus its sections.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub cmd_offset: usize,
    pub command: SegmentCommand64,
    pub sections: Vec<(usize, Section64)>,
}

impl SegmentInfo {
    pub fn name(&self) -> String {
        name_from_fixed(&self.command.segname)
    }

    pub fn section_named(&self, name: &str) -> Option<&(usize, Section64)> {
        self.sections
            .iter()
            .find(|(_, s)| name_from_fixed(&s.sectname) == name)
    }
}

/// The result of walking a container's Mach-O header once.
#[derive(Debug, Clone)]
pub struct ParsedMachO {
    pub header: MachHeader64,
    pub commands: Vec<LoadCommandEntry>,
    pub segments: Vec<SegmentInfo>,
    pub symtab: Option<(usize, SymtabCommand)>,
    pub dysymtab: Option<(usize, DysymtabCommand)>,
    pub fileset_entries: Vec<(usize, FilesetEntryCommandHeader, String)>,
    /// Offset one past the last load command (start of free command space).
    pub commands_end: usize,
}

impl ParsedMachO {
    pub fn is_fileset(&self) -> bool {
        self.header.file_type == MH_FILESET
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Byte capacity available to load commands before the content of the
    /// first segment (conventionally `__TEXT`, whose `fileoff` is usually
    /// zero and therefore overlaps the header).
    pub fn command_area_capacity(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.command.fileoff + s.command.filesize)
            .filter(|&end| end > 0)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// `PrelinkedLastAddress`/`MachoGetLastAddress`: highest
    /// `vmaddr + align_up(vmsize)` across all segments.
    pub fn last_vm_address(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.command.vmaddr + align_up(s.command.vmsize, MACHO_PAGE_SIZE))
            .max()
            .unwrap_or(0)
    }

    pub fn last_file_offset(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.command.fileoff + s.command.filesize)
            .max()
            .unwrap_or(0)
    }
}

/// Parse the Mach-O header, load commands, segments, and sections out of
/// `data`. Symbol and relocation tables are read lazily by their own
/// modules, since not every caller needs them.
pub fn parse(data: &[u8]) -> Result<ParsedMachO> {
    let header: MachHeader64 = data
        .pread_with(0, LE)
        .map_err(|e| KextError::LoadError(format!("mach header: {e}")))?;

    if header.magic != MH_MAGIC_64 {
        return Err(KextError::LoadError(format!(
            "unsupported Mach-O magic 0x{:x}",
            header.magic
        )));
    }

    let mut offset = size_of::<MachHeader64>();
    let mut commands = Vec::with_capacity(header.ncmds as usize);
    let mut segments = Vec::new();
    let mut symtab = None;
    let mut dysymtab = None;
    let mut fileset_entries = Vec::new();

    for _ in 0..header.ncmds {
        let base: LoadCommandHeader = data
            .pread_with(offset, LE)
            .map_err(|e| KextError::LoadError(format!("load command: {e}")))?;
        if base.cmd_size == 0 || offset + base.cmd_size as usize > data.len() {
            return Err(KextError::LoadError("load command overruns buffer".into()));
        }

        commands.push(LoadCommandEntry {
            offset,
            cmd: base.cmd,
            cmd_size: base.cmd_size,
        });

        match base.cmd {
            LC_SEGMENT_64 => {
                let command: SegmentCommand64 = data.pread_with(offset, LE)?;
                let mut sections = Vec::with_capacity(command.nsects as usize);
                let mut sec_off = offset + size_of::<SegmentCommand64>();
                for _ in 0..command.nsects {
                    let section: Section64 = data.pread_with(sec_off, LE)?;
                    sections.push((sec_off, section));
                    sec_off += size_of::<Section64>();
                }
                segments.push(SegmentInfo {
                    cmd_offset: offset,
                    command,
                    sections,
                });
            }
            LC_SYMTAB => {
                symtab = Some((offset, data.pread_with(offset, LE)?));
            }
            LC_DYSYMTAB => {
                dysymtab = Some((offset, data.pread_with(offset, LE)?));
            }
            LC_FILESET_ENTRY => {
                let command: FilesetEntryCommandHeader = data.pread_with(offset, LE)?;
                let name_off = offset + command.entry_id_offset as usize;
                let name = read_c_string(data, name_off)?;
                fileset_entries.push((offset, command, name));
            }
            _ => {}
        }

        offset += base.cmd_size as usize;
    }

    Ok(ParsedMachO {
        header,
        commands,
        segments,
        symtab,
        dysymtab,
        fileset_entries,
        commands_end: offset,
    })
}

/// Read a NUL-terminated string at `offset`.
pub fn read_c_string(data: &[u8], offset: usize) -> Result<String> {
    let end = data[offset..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| KextError::LoadError("unterminated C string".into()))?;
    Ok(String::from_utf8_lossy(&data[offset..offset + end]).into_owned())
}

/// Write `value` at `offset` in `data` using the fixed little-endian Mach-O
/// byte order, growing the backing `Vec` is never performed here: callers
/// must have already reserved capacity (lifetimes §5, `Init` invariants).
pub fn write_at<T>(data: &mut [u8], offset: usize, value: T) -> Result<()>
where
    T: scroll::ctx::TryIntoCtx<scroll::Endian, Error = scroll::Error>,
{
    data.pwrite_with(value, offset, LE)?;
    Ok(())
}

/// Zero-fill `[offset, offset+len)`.
pub fn zero_fill(data: &mut [u8], offset: usize, len: usize) {
    data[offset..offset + len].fill(0);
}

/// Append a new load command's bytes right after the last existing one,
/// bumping `ncmds`/`sizeofcmds` in the header. Fails with `Unsupported` if
/// the command area would grow past the first segment's file footprint;
/// callers are expected to have called [`MergeSegments`] first when that
/// is a recoverable condition.
pub fn append_load_command(
    data: &mut Vec<u8>,
    parsed: &mut ParsedMachO,
    bytes: &[u8],
) -> Result<usize> {
    let insert_at = parsed.commands_end;
    let capacity = parsed.command_area_capacity();

    if (insert_at + bytes.len()) as u64 > capacity {
        return Err(KextError::Unsupported(
            "load commands do not fit before the first segment's content",
        ));
    }

    data[insert_at..insert_at + bytes.len()].copy_from_slice(bytes);

    parsed.header.ncmds += 1;
    parsed.header.sizeofcmds += bytes.len() as u32;
    write_at(data, 0, parsed.header)?;

    parsed.commands_end += bytes.len();
    Ok(insert_at)
}

/// `MergeSegments`: collapse every segment whose name starts with `prefix`
/// into the first one, reclaiming the freed `SEGMENT_64` command slots so
/// the header has more room, the way `RebuildMachHeader` does.
pub fn merge_segments_with_prefix(
    data: &mut Vec<u8>,
    parsed: &mut ParsedMachO,
    prefix: &str,
) -> Result<()> {
    let victims: Vec<&SegmentInfo> = parsed
        .segments
        .iter()
        .filter(|s| s.name().starts_with(prefix))
        .collect();

    if victims.len() < 2 {
        return Ok(());
    }

    let first = victims[0].clone();
    let last = victims[victims.len() - 1].clone();
    let merged_vmsize = (last.command.vmaddr + last.command.vmsize) - first.command.vmaddr;
    let merged_filesize = (last.command.fileoff + last.command.filesize) - first.command.fileoff;

    let mut merged = first.command;
    merged.vmsize = merged_vmsize;
    merged.filesize = merged_filesize;
    merged.nsects = 0;
    write_at(data, first.cmd_offset, merged)?;

    // Zero and logically drop every victim after the first: shift every
    // later command down over the freed slots.
    let victim_offsets: Vec<usize> = victims[1..].iter().map(|s| s.cmd_offset).collect();
    let victim_size: u32 = victim_offsets
        .iter()
        .map(|&off| -> Result<u32> {
            let base: LoadCommandHeader = data.pread_with(off, LE)?;
            Ok(base.cmd_size)
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sum();

    let shift_from = victim_offsets[0] + victim_size as usize;
    let shift_len = parsed.commands_end - shift_from;
    data.copy_within(shift_from..shift_from + shift_len, victim_offsets[0]);
    zero_fill(
        data,
        victim_offsets[0] + shift_len,
        parsed.commands_end - victim_offsets[0] - shift_len,
    );

    parsed.header.ncmds -= (victims.len() - 1) as u32;
    parsed.header.sizeofcmds -= victim_size;
    write_at(data, 0, parsed.header)?;

    *parsed = parse(data)?;
    Ok(())
}

/// `MachoExpandFile`: decompress/expand a kext Mach-O (already laid out at
/// `offset..offset+size` in `data`) in place, section-aligning every
/// segment, and return its new total size. For a prelinked kext this is
/// typically a no-op copy since injected binaries are supplied uncompressed
/// by the caller; kept as an explicit step so the KC path can reuse the
/// same alignment pass its `__REGION` layout requires.
pub fn expand_macho_in_place(exe: &[u8]) -> Result<Vec<u8>> {
    // The engine does not itself decompress LZVN/LZSS-compressed Mach-O
    // executables (that lives in the out-of-scope compression library);
    // callers hand in an already-decompressed image, so this step is the
    // alignment/padding pass only.
    let parsed = parse(exe)?;
    let aligned_size = align_up(parsed.last_file_offset(), MACHO_PAGE_SIZE) as usize;
    let mut out = exe.to_vec();
    out.resize(aligned_size.max(exe.len()), 0);
    Ok(out)
}

/// Aligned VM size of a kext image, used by `ReserveKextSize`.
pub fn aligned_vm_size(exe: &[u8]) -> Result<u64> {
    let parsed = parse(exe)?;
    Ok(align_up(
        parsed
            .segments
            .iter()
            .map(|s| s.command.vmsize)
            .sum::<u64>(),
        MACHO_PAGE_SIZE,
    ))
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use scroll::Pwrite;

    /// Build a minimal well-formed 64-bit Mach-O image with the requested
    /// segments, each zero-filled, no sections. Useful across the crate's
    /// unit and integration tests.
    pub fn build_minimal_macho(file_type: u32, segments: &[(&str, u64, u64, u64, u64)]) -> Vec<u8> {
        let header_size = size_of::<MachHeader64>();
        let cmd_size = size_of::<SegmentCommand64>();
        let sizeofcmds = cmd_size * segments.len();
        let total_header = header_size + sizeofcmds;

        let max_end = segments
            .iter()
            .map(|(_, _, _, fileoff, filesize)| fileoff + filesize)
            .max()
            .unwrap_or(0)
            .max(total_header as u64);

        let mut data = vec![0u8; align_up(max_end, MACHO_PAGE_SIZE) as usize];

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cpu_type: 0x0100_0007, // CPU_TYPE_X86_64
            cpu_subtype: 3,
            file_type,
            ncmds: segments.len() as u32,
            sizeofcmds: sizeofcmds as u32,
            flags: 0,
            reserved: 0,
        };
        data.pwrite_with(header, 0, LE).unwrap();

        let mut offset = header_size;
        for (name, vmaddr, vmsize, fileoff, filesize) in segments {
            let seg = SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmd_size: cmd_size as u32,
                segname: segname(name),
                vmaddr: *vmaddr,
                vmsize: *vmsize,
                fileoff: *fileoff,
                filesize: *filesize,
                maxprot: VM_PROT_ALL_RWX,
                initprot: VM_PROT_ALL_RWX,
                nsects: 0,
                flags: 0,
            };
            data.pwrite_with(seg, offset, LE).unwrap();
            offset += cmd_size;
        }

        data
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::build_minimal_macho;
    use super::*;

    #[test]
    fn parses_segments_back() {
        let data = build_minimal_macho(
            MH_EXECUTE,
            &[
                ("__TEXT", 0x1000, 0x1000, 0, 0x1000),
                ("__DATA", 0x2000, 0x1000, 0x1000, 0x1000),
            ],
        );
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.segment("__TEXT").unwrap().command.vmaddr, 0x1000);
        assert_eq!(parsed.last_vm_address(), 0x3000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_minimal_macho(MH_EXECUTE, &[("__TEXT", 0, 0x1000, 0, 0x1000)]);
        data[0] = 0;
        assert!(parse(&data).is_err());
    }
}
