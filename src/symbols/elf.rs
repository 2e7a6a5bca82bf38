//! On-disk ELF lookups: dynamic symbols, executable segments and section listings.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use goblin::container::Ctx;
use goblin::elf::program_header::{ProgramHeader, PF_R, PF_X, PT_LOAD};
use goblin::elf::section_header::SHT_DYNSYM;
use goblin::elf::sym::Symtab;
use goblin::elf::Elf;
use goblin::strtab::Strtab;

use crate::error::ArtscopeError;

/// A symbol hit: which candidate matched and its file-relative virtual address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolHit {
    pub name: String,
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionInfo {
    pub name: String,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

/// Raw bytes of a shared object, kept only for one resolution pass.
pub struct ElfImage {
    origin: String,
    bytes: Vec<u8>,
}

impl ElfImage {
    pub fn open(path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        let bytes = fs::read(path).map_err(|err| ArtscopeError::from_io_error(origin.clone(), err))?;
        Ok(Self { origin, bytes })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            origin: "<memory>".to_string(),
            bytes,
        }
    }

    fn parse(&self) -> Result<Elf<'_>> {
        Elf::parse(&self.bytes).map_err(|err| {
            ArtscopeError::ElfParse {
                path: self.origin.clone(),
                reason: err.to_string(),
            }
            .into()
        })
    }

    /// First candidate (in priority order) defined in the dynamic symbol table.
    pub fn find_symbol(&self, candidates: &[&str]) -> Result<Option<SymbolHit>> {
        let elf = self.parse()?;
        let table = self.dynamic_symbols(&elf)?;
        for candidate in candidates {
            if let Some(value) = table
                .iter()
                .find(|(name, _)| name == candidate)
                .map(|(_, value)| *value)
            {
                return Ok(Some(SymbolHit {
                    name: candidate.to_string(),
                    value,
                }));
            }
        }
        Ok(None)
    }

    /// Defined dynamic symbols as `(name, value)`. Undefined entries have value 0
    /// and are left out.
    fn dynamic_symbols(&self, elf: &Elf<'_>) -> Result<Vec<(String, u64)>> {
        let dynsym = elf
            .section_headers
            .iter()
            .find(|sh| sh.sh_type == SHT_DYNSYM);

        let Some(dynsym) = dynsym else {
            // Section headers stripped: use the table reached through PT_DYNAMIC.
            return Ok(elf
                .dynsyms
                .iter()
                .filter(|sym| sym.st_value != 0)
                .filter_map(|sym| {
                    elf.dynstrtab
                        .get_at(sym.st_name)
                        .map(|name| (name.to_string(), sym.st_value))
                })
                .collect());
        };

        let strtab_hdr = elf
            .section_headers
            .get(dynsym.sh_link as usize)
            .ok_or_else(|| anyhow!("dynsym sh_link {} out of range", dynsym.sh_link))?;

        let ctx = Ctx::new(elf.header.container()?, elf.header.endianness()?);
        let entsize = dynsym.sh_entsize.max(1);
        let count = (dynsym.sh_size / entsize) as usize;
        let syms = Symtab::parse(&self.bytes, dynsym.sh_offset as usize, count, ctx)
            .context("parse dynsym")?;
        let strs = Strtab::parse(
            &self.bytes,
            strtab_hdr.sh_offset as usize,
            strtab_hdr.sh_size as usize,
            0x0,
        )
        .context("parse dynstr")?;

        Ok(syms
            .iter()
            .filter(|sym| sym.st_name != 0 && sym.st_value != 0)
            .filter_map(|sym| {
                strs.get_at(sym.st_name)
                    .map(|name| (name.to_string(), sym.st_value))
            })
            .collect())
    }

    /// Page-aligned virtual address of the executable `PT_LOAD` that starts at
    /// `file_offset`. Subtracting it from the mapping start yields the load bias.
    pub fn exec_segment_vaddr(&self, file_offset: u64) -> Result<Option<u64>> {
        let elf = self.parse()?;
        Ok(exec_load_vaddr(&elf.program_headers, file_offset, page_size()))
    }

    pub fn sections(&self) -> Result<Vec<SectionInfo>> {
        let elf = self.parse()?;
        Ok(elf
            .section_headers
            .iter()
            .map(|sh| SectionInfo {
                name: elf
                    .shdr_strtab
                    .get_at(sh.sh_name)
                    .unwrap_or_default()
                    .to_string(),
                addr: sh.sh_addr,
                offset: sh.sh_offset,
                size: sh.sh_size,
            })
            .collect())
    }
}

/// Page size of the running system. The loader maps segments on page
/// boundaries regardless of their `p_align`.
pub fn page_size() -> u64 {
    // SAFETY: sysconf only reads a system constant.
    let size = unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) };
    u64::try_from(size)
        .ok()
        .filter(|size| size.is_power_of_two())
        .unwrap_or(0x1000)
}

fn exec_load_vaddr(headers: &[ProgramHeader], file_offset: u64, page: u64) -> Option<u64> {
    let mask = page - 1;
    headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0)
        .find(|ph| ph.p_offset & !mask == file_offset)
        .map(|ph| ph.p_vaddr & !mask)
}

pub fn list_sections(path: &Path) -> Result<Vec<SectionInfo>> {
    ElfImage::open(path)?.sections()
}
