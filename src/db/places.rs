use super::{Database, DbError};
use crate::slug;
use rusqlite::{OptionalExtension, Row, params};
use tracing::info;

const MAX_PLACE_SLUG_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub location: String,
    pub country: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub favorites: i64,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewPlace {
    pub name: String,
    pub location: String,
    pub country: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub sort_order: i64,
}

fn place_from_row(row: &Row) -> rusqlite::Result<Place> {
    Ok(Place {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        location: row.get(3)?,
        country: row.get(4)?,
        start_date: row.get(5)?,
        end_date: row.get(6)?,
        favorites: row.get(7)?,
        sort_order: row.get(8)?,
    })
}

const PLACE_COLUMNS: &str =
    "id, slug, name, location, country, start_date, end_date, favorites, sort_order";

impl Database {
    /// Create a place with a unique slug derived from its name, location, and
    /// country.
    pub fn create_place(&self, new: &NewPlace) -> Result<Place, DbError> {
        let conn = self.lock();

        let text = [new.name.as_str(), new.location.as_str(), new.country.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let slug = slug::unique_text_slug(&text, MAX_PLACE_SLUG_LEN, |candidate| {
            conn.query_row(
                "SELECT 1 FROM places WHERE slug = ?",
                [candidate],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
            // On a query error, claim the slug is free and let the INSERT
            // surface the real failure.
            .unwrap_or(false)
        });

        conn.execute(
            "INSERT INTO places (slug, name, location, country, start_date, end_date, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                slug,
                new.name,
                new.location,
                new.country,
                new.start_date,
                new.end_date,
                new.sort_order
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!("created place {} ({:?})", id, slug);

        Ok(Place {
            id,
            slug,
            name: new.name.clone(),
            location: new.location.clone(),
            country: new.country.clone(),
            start_date: new.start_date.clone(),
            end_date: new.end_date.clone(),
            favorites: 0,
            sort_order: new.sort_order,
        })
    }

    pub fn get_place(&self, id: i64) -> Result<Option<Place>, DbError> {
        let conn = self.lock();
        let place = conn
            .query_row(
                &format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = ?"),
                [id],
                place_from_row,
            )
            .optional()?;
        Ok(place)
    }

    pub fn get_place_by_slug(&self, slug: &str) -> Result<Option<Place>, DbError> {
        let conn = self.lock();
        let place = conn
            .query_row(
                &format!("SELECT {PLACE_COLUMNS} FROM places WHERE slug = ?"),
                [slug],
                place_from_row,
            )
            .optional()?;
        Ok(place)
    }

    /// All places in display order.
    pub fn list_places(&self) -> Result<Vec<Place>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLACE_COLUMNS} FROM places ORDER BY sort_order, name"
        ))?;
        let places = stmt
            .query_map([], place_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(places)
    }

    pub fn update_place(&self, place: &Place) -> Result<(), DbError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE places
             SET name = ?1, location = ?2, country = ?3, start_date = ?4, end_date = ?5,
                 sort_order = ?6
             WHERE id = ?7",
            params![
                place.name,
                place.location,
                place.country,
                place.start_date,
                place.end_date,
                place.sort_order,
                place.id
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a place. Photo rows go with it via the cascading foreign key;
    /// blob-directory removal is the caller's job.
    pub fn delete_place(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM places WHERE id = ?", [id])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        info!("deleted place {}", id);
        Ok(())
    }

    pub fn place_exists(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.lock();
        let found = conn
            .query_row("SELECT 1 FROM places WHERE id = ?", [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Every known place id, for the reconciler's directory sweep.
    pub fn place_ids(&self) -> Result<Vec<i64>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM places")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}
