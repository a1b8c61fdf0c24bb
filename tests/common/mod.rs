#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use encoding_rs::WINDOWS_1251;
use flate2::write::GzEncoder;
use flate2::Compression;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub fn smb_document(tin: &str, snapshot: &str, code: &str) -> String {
    format!(
        r#"<Документ ИдДок="{tin}" ДатаСост="{snapshot}" ВидСубМСП="1" КатСубМСП="1" ДатаВклМСП="01.08.2016">
  <ОргВклМСП НаимОрг="ООО &quot;ТЕСТ {tin}&quot;" НаимОргСокр="ТЕСТ" ИННЮЛ="{tin}" ОГРН="1{tin}"/>
  <СведМН КодРегион="77"><Регион Тип="Г" Наим="МОСКВА"/></СведМН>
  <СвОКВЭД><СвОКВЭДОсн КодОКВЭД="{code}" НаимОКВЭД="ВИД"/><СвОКВЭДДоп КодОКВЭД="46.90"/></СвОКВЭД>
</Документ>"#
    )
}

pub fn empl_document(tin: &str, snapshot: &str, employees: &str) -> String {
    format!(
        r#"<Документ ИдДок="{tin}" ДатаДок="15.07.2019" ДатаСост="{snapshot}">
  <СведНП НаимОрг="АО ЛУЧ" ИННЮЛ="{tin}"/>
  <СведССЧР КолРаб="{employees}"/>
</Документ>"#
    )
}

/// A records entry as the FTS publishes it: windows-1251 with a declaration.
pub fn xml_entry(documents: &[String]) -> Vec<u8> {
    let text = format!(
        "<?xml version=\"1.0\" encoding=\"windows-1251\"?>\n<Файл ИдФайл=\"TEST\" ВерсФорм=\"4.05\" КолДок=\"{}\">\n{}\n</Файл>\n",
        documents.len(),
        documents.join("\n")
    );
    let (bytes, _, unmappable) = WINDOWS_1251.encode(&text);
    assert!(!unmappable);
    bytes.into_owned()
}

pub fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap();
}

pub fn write_gz(path: &Path, bytes: &[u8]) {
    write_gz_members(path, &[bytes]);
}

/// One gzip member per slice, concatenated into a single file.
pub fn write_gz_members(path: &Path, members: &[&[u8]]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = File::create(path).unwrap();
    for member in members {
        let mut encoder = GzEncoder::new(&mut file, Compression::default());
        encoder.write_all(member).unwrap();
        encoder.finish().unwrap();
    }
}

/// Header and data rows of every chunk file in `dir`, rows sorted.
pub fn read_chunks(dir: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .collect();
    paths.sort();
    let mut header = Vec::new();
    let mut rows = Vec::new();
    for path in paths {
        let (h, mut r) = read_csv(&path);
        header = h;
        rows.append(&mut r);
    }
    rows.sort();
    (header, rows)
}

pub fn read_csv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    (header, rows)
}

pub fn column(header: &[String], name: &str) -> usize {
    header.iter().position(|h| h == name).unwrap()
}
