//! Entity builders for tests and the in-memory emulators.

use tome_core::{Category, Chapter, HistoryEntry, LibrarySettings, Manga, PublicationStatus};

pub fn manga(id: &str, modified: i64) -> Manga {
    Manga {
        id: id.to_string(),
        source: "mangadex".to_string(),
        url: format!("/title/{}", id),
        title: format!("Manga {}", id),
        author: None,
        artist: None,
        description: None,
        cover_url: None,
        status: PublicationStatus::Ongoing,
        genres: Vec::new(),
        category_ids: Vec::new(),
        favorite: true,
        date_added: 1_000,
        modified,
        deleted: false,
    }
}

pub fn chapter(id: &str, manga_id: &str, modified: i64) -> Chapter {
    Chapter {
        id: id.to_string(),
        manga_id: manga_id.to_string(),
        url: format!("/chapter/{}", id),
        name: format!("Chapter {}", id),
        number: 1.0,
        is_read: false,
        last_page_read: 0,
        bookmarked: false,
        date_upload: 0,
        modified,
        deleted: false,
    }
}

pub fn category(id: &str, modified: i64) -> Category {
    Category {
        id: id.to_string(),
        name: format!("Category {}", id),
        sort_order: 0,
        flags: 0,
        modified,
        deleted: false,
    }
}

pub fn history(id: &str, chapter_id: &str, last_read: i64) -> HistoryEntry {
    HistoryEntry {
        id: id.to_string(),
        manga_id: "m1".to_string(),
        chapter_id: chapter_id.to_string(),
        last_read,
        time_read_ms: 0,
        modified: last_read,
        deleted: false,
    }
}

pub fn settings(modified: i64) -> LibrarySettings {
    LibrarySettings {
        id: tome_core::SETTINGS_DOCUMENT_ID.to_string(),
        values: Default::default(),
        modified,
    }
}
