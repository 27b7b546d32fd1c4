//! ELFとDWARFの読み込み機能

use crate::Result;
use object::{Object, ObjectSection};
use std::fs;
use std::path::Path;

/// DWARFセクションの読み取り型
pub type DwarfReader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// DWARFローダー
pub struct DwarfLoader {
    /// オブジェクトファイル
    object_file: object::File<'static>,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<DwarfReader>,
    /// `.eh_frame`（CFA計算用）
    eh_frame: gimli::EhFrame<DwarfReader>,
    /// `.eh_frame` のポインタエンコーディング用のセクションアドレス
    bases: gimli::BaseAddresses,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // 'staticライフタイムを得るためにリークさせる（セッション中は解放しない）
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        let dwarf = load_dwarf(&object_file)?;

        let endian = endian_of(&object_file);
        let mut eh_frame = gimli::EhFrame::new(section_data(&object_file, ".eh_frame"), endian);
        if object_file.is_64() {
            eh_frame.set_address_size(8);
        }

        let mut bases = gimli::BaseAddresses::default();
        if let Some(section) = object_file.section_by_name(".eh_frame") {
            bases = bases.set_eh_frame(section.address());
        }
        if let Some(section) = object_file.section_by_name(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(section.address());
        }
        if let Some(section) = object_file.section_by_name(".text") {
            bases = bases.set_text(section.address());
        }
        if let Some(section) = object_file.section_by_name(".got") {
            bases = bases.set_got(section.address());
        }

        tracing::debug!("loaded DWARF from {:?}", path);

        Ok(Self {
            object_file,
            dwarf,
            eh_frame,
            bases,
        })
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfReader> {
        &self.dwarf
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    pub fn eh_frame(&self) -> &gimli::EhFrame<DwarfReader> {
        &self.eh_frame
    }

    pub fn bases(&self) -> &gimli::BaseAddresses {
        &self.bases
    }

    /// addr2line 用に DWARF をもう一度読み込む
    ///
    /// `addr2line::Context` は `gimli::Dwarf` の所有権を要求するため、別インスタンスを作ります。
    pub fn load_dwarf_copy(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        load_dwarf(&self.object_file)
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// PIE実行ファイルの場合、DWARF上のアドレスはオフセットであり、
    /// 実行時ベースアドレスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        use object::ObjectKind;

        // ET_DYN = PIE実行ファイルまたは共有ライブラリ
        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }
}

fn endian_of(object_file: &object::File<'static>) -> gimli::RunTimeEndian {
    if object_file.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    }
}

fn section_data(object_file: &object::File<'static>, name: &str) -> &'static [u8] {
    object_file
        .section_by_name(name)
        .and_then(|section| section.data().ok())
        .unwrap_or(&[])
}

fn load_dwarf(object_file: &object::File<'static>) -> Result<gimli::Dwarf<DwarfReader>> {
    let endian = endian_of(object_file);
    let load_section = |id: gimli::SectionId| -> Result<DwarfReader> {
        Ok(gimli::EndianSlice::new(section_data(object_file, id.name()), endian))
    };

    gimli::Dwarf::load(load_section).map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
}
