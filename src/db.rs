use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::location::{Coordinates, KnownLocation, LocationFix, UnresolvedOrder, RESOLVED_TAG};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(db_path: P) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;
    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "database context established"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS known_addrs (
            id TEXT PRIMARY KEY,
            addr TEXT NOT NULL,
            city TEXT NOT NULL,
            zipcode INTEGER NOT NULL,
            resolution TEXT NOT NULL
                CHECK (resolution IN ('resolved', 'not_found', 'out_of_bounds')),
            lat TEXT,
            lng TEXT,
            created_at TEXT NOT NULL,
            last_modified_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS orders (
            order_id TEXT PRIMARY KEY,
            customer_addr1 TEXT NOT NULL,
            customer_addr2 TEXT,
            customer_city TEXT NOT NULL,
            customer_zipcode INTEGER NOT NULL,
            customer_neighborhood TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_known_addrs_match ON known_addrs(zipcode, city, addr);
        "#,
    )?;

    // orders can predate the location cache; the association column is ours
    ensure_column(
        connection,
        "orders",
        "known_addr_id TEXT REFERENCES known_addrs(id)",
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_orders_known_addr ON orders(known_addr_id)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Orders with no cached location, minus the ones flagged out of area. The
/// prefix is compared literally and case-sensitively.
pub fn load_unresolved_orders(
    connection: &Connection,
    out_of_area_prefix: &str,
) -> AppResult<Vec<UnresolvedOrder>> {
    let mut stmt = connection.prepare(
        "SELECT order_id, customer_addr1, customer_addr2, customer_city, customer_zipcode,
                customer_neighborhood
        FROM orders
        WHERE known_addr_id IS NULL
          AND substr(customer_neighborhood, 1, length(?1)) <> ?1
        ORDER BY rowid ASC",
    )?;
    let orders = stmt
        .query_map([out_of_area_prefix], |row| {
            let order_id: String = row.get(0)?;
            let addr1: String = row.get(1)?;
            let addr2: Option<String> = row.get(2)?;
            let city: String = row.get(3)?;
            let zipcode: i64 = row.get(4)?;
            let neighborhood: String = row.get(5)?;
            Ok(UnresolvedOrder::from_raw(
                order_id,
                &addr1,
                addr2.as_deref(),
                &city,
                zipcode,
                neighborhood,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    debug!(count = orders.len(), "loaded orders without known locations");
    Ok(orders)
}

/// Every cached location, with address and city folded to lower case.
pub fn load_known_locations(connection: &Connection) -> AppResult<Vec<KnownLocation>> {
    let mut stmt = connection.prepare(
        "SELECT id, addr, city, zipcode, resolution, lat, lng, created_at, last_modified_at
        FROM known_addrs
        ORDER BY created_at ASC, rowid ASC",
    )?;
    let raw = stmt
        .query_map([], read_known_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut locations = Vec::with_capacity(raw.len());
    for row in raw {
        locations.push(KnownLocation {
            fix: LocationFix::from_columns(&row.resolution, row.lat, row.lng)?,
            address_line: row.addr.to_lowercase(),
            city: row.city.to_lowercase(),
            postal_code: row.zipcode,
            created_at: parse_timestamp(&row.created_at)?,
            last_modified_at: parse_timestamp(&row.last_modified_at)?,
            id: row.id,
        });
    }
    debug!(count = locations.len(), "loaded known locations");
    Ok(locations)
}

struct KnownRow {
    id: String,
    addr: String,
    city: String,
    zipcode: i64,
    resolution: String,
    lat: Option<String>,
    lng: Option<String>,
    created_at: String,
    last_modified_at: String,
}

fn read_known_row(row: &Row<'_>) -> rusqlite::Result<KnownRow> {
    Ok(KnownRow {
        id: row.get(0)?,
        addr: row.get(1)?,
        city: row.get(2)?,
        zipcode: row.get(3)?,
        resolution: row.get(4)?,
        lat: row.get(5)?,
        lng: row.get(6)?,
        created_at: row.get(7)?,
        last_modified_at: row.get(8)?,
    })
}

fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| AppError::Parse(format!("invalid timestamp {value:?}: {err}")))
}

/// Caches a new location for `order` under a fresh id. Pass a transaction to
/// keep the insert inside the run's unit of work.
pub fn insert_known_location(
    connection: &Connection,
    order: &UnresolvedOrder,
    fix: LocationFix,
) -> AppResult<KnownLocation> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let stamp = now.to_rfc3339();
    let (lat, lng) = match fix.coordinates() {
        Some(coords) => (Some(coords.lat.as_str()), Some(coords.lng.as_str())),
        None => (None, None),
    };

    connection.execute(
        "INSERT INTO known_addrs
            (id, addr, city, zipcode, resolution, lat, lng, created_at, last_modified_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            id,
            order.address_line,
            order.city,
            order.postal_code,
            fix.as_tag(),
            lat,
            lng,
            stamp
        ],
    )?;
    trace!(
        location_id = %id,
        resolution = fix.as_tag(),
        "known location inserted"
    );

    Ok(KnownLocation {
        id,
        address_line: order.address_line.to_lowercase(),
        city: order.city.to_lowercase(),
        postal_code: order.postal_code,
        fix,
        created_at: now,
        last_modified_at: now,
    })
}

pub fn associate_order(connection: &Connection, order_id: &str, location_id: &str) -> AppResult<()> {
    let updated = connection.execute(
        "UPDATE orders SET known_addr_id = ?1 WHERE order_id = ?2",
        (location_id, order_id),
    )?;
    if updated == 0 {
        return Err(AppError::MissingOrder(order_id.to_string()));
    }
    trace!(order_id, location_id, "order associated with known location");
    Ok(())
}

/// Coordinates of every order joined to a resolved location, one entry per
/// order. A resolved row with a missing coordinate yields an empty string so
/// the caller's parse step rejects it.
pub fn load_order_coordinates(connection: &Connection) -> AppResult<Vec<Coordinates>> {
    let mut stmt = connection.prepare(
        "SELECT COALESCE(k.lat, ''), COALESCE(k.lng, '')
        FROM orders o
        JOIN known_addrs k ON o.known_addr_id = k.id
        WHERE k.resolution = ?1
        ORDER BY o.rowid ASC",
    )?;
    let coords = stmt
        .query_map([RESOLVED_TAG], |row| {
            let lat: String = row.get(0)?;
            let lng: String = row.get(1)?;
            Ok(Coordinates::from_stored(lat, lng))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(coords)
}

pub fn count_known_locations(connection: &Connection) -> AppResult<i64> {
    Ok(connection.query_row("SELECT COUNT(*) FROM known_addrs", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded() -> (tempfile::TempDir, Connection) {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("orders.db")).unwrap();
        ctx.connection
            .execute_batch(
                "INSERT INTO orders (order_id, customer_addr1, customer_addr2, customer_city,
                    customer_zipcode, customer_neighborhood)
                VALUES
                    ('A1', ' 123 Main St ', NULL, 'Austin', 78701, 'Downtown'),
                    ('A2', '9 Elm Ct', ' Unit B ', 'Cedar Park', 78613, 'North'),
                    ('A3', '1 Far Rd', NULL, 'Austin', 78701, 'Out of Area - North');",
            )
            .unwrap();
        (dir, ctx.connection)
    }

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("nested").join("test.db")).unwrap();
        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('orders','known_addrs')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 2);
        assert!(column_exists(&ctx.connection, "orders", "known_addr_id").unwrap());
        assert!(ctx.path.ends_with("test.db"));
    }

    #[test]
    fn adds_association_column_to_existing_orders_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE orders (
                    order_id TEXT PRIMARY KEY,
                    customer_addr1 TEXT NOT NULL,
                    customer_addr2 TEXT,
                    customer_city TEXT NOT NULL,
                    customer_zipcode INTEGER NOT NULL,
                    customer_neighborhood TEXT NOT NULL DEFAULT ''
                );",
            )
            .unwrap();
        }
        let ctx = bootstrap(&path).unwrap();
        assert!(column_exists(&ctx.connection, "orders", "known_addr_id").unwrap());
        // idempotent
        drop(ctx);
        bootstrap(&path).unwrap();
    }

    #[test]
    fn skips_out_of_area_and_normalizes() {
        let (_dir, conn) = seeded();
        let orders = load_unresolved_orders(&conn, "Out of Area").unwrap();
        let ids: Vec<_> = orders.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "A2"]);
        assert_eq!(orders[0].address_line, "123 Main St");
        assert_eq!(orders[1].address_line, "9 Elm Ct Unit B");
    }

    #[test]
    fn out_of_area_prefix_is_literal_and_case_sensitive() {
        let (_dir, conn) = seeded();
        conn.execute_batch(
            "INSERT INTO orders (order_id, customer_addr1, customer_city, customer_zipcode,
                customer_neighborhood)
            VALUES ('L1', '4 Oak Ln', 'Austin', 78701, 'OUT OF AREA lookalike'),
                   ('L2', '5 Oak Ln', 'Austin', 78701, 'Out-of-Area');",
        )
        .unwrap();

        let ids = |prefix: &str| -> Vec<String> {
            load_unresolved_orders(&conn, prefix)
                .unwrap()
                .into_iter()
                .map(|o| o.order_id)
                .collect()
        };
        assert_eq!(ids("Out of Area"), vec!["A1", "A2", "L1", "L2"]);
        // `_` and `%` are not wildcards
        assert_eq!(ids("Out_of_Area"), vec!["A1", "A2", "A3", "L1", "L2"]);
        assert_eq!(ids("%"), vec!["A1", "A2", "A3", "L1", "L2"]);
        assert_eq!(ids("Out-of"), vec!["A1", "A2", "A3", "L1"]);
    }

    #[test]
    fn inserted_locations_round_trip_folded() {
        let (_dir, mut conn) = seeded();
        let orders = load_unresolved_orders(&conn, "Out of Area").unwrap();
        let tx = conn.transaction().unwrap();
        let created = insert_known_location(
            &tx,
            &orders[0],
            LocationFix::Resolved(Coordinates::from_degrees(30.5, -97.7)),
        )
        .unwrap();
        insert_known_location(&tx, &orders[1], LocationFix::OutOfBounds).unwrap();
        associate_order(&tx, "A1", &created.id).unwrap();
        tx.commit().unwrap();

        let known = load_known_locations(&conn).unwrap();
        assert_eq!(known.len(), 2);
        let first = known.iter().find(|k| k.id == created.id).unwrap();
        assert_eq!(first.address_line, "123 main st");
        assert_eq!(first.city, "austin");
        assert_eq!(
            first.fix,
            LocationFix::Resolved(Coordinates::from_stored("30.5000000", "-97.7000000"))
        );
        assert!(known.iter().any(|k| k.fix == LocationFix::OutOfBounds));

        let remaining = load_unresolved_orders(&conn, "Out of Area").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].order_id, "A2");
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (_dir, mut conn) = seeded();
        let orders = load_unresolved_orders(&conn, "Out of Area").unwrap();
        {
            let tx = conn.transaction().unwrap();
            let created = insert_known_location(&tx, &orders[0], LocationFix::NotFound).unwrap();
            associate_order(&tx, "A1", &created.id).unwrap();
        }
        assert_eq!(count_known_locations(&conn).unwrap(), 0);
        assert_eq!(load_unresolved_orders(&conn, "Out of Area").unwrap().len(), 2);
    }

    #[test]
    fn associating_unknown_order_fails() {
        let (_dir, conn) = seeded();
        let orders = load_unresolved_orders(&conn, "Out of Area").unwrap();
        let created = insert_known_location(&conn, &orders[0], LocationFix::NotFound).unwrap();
        assert!(matches!(
            associate_order(&conn, "missing", &created.id),
            Err(AppError::MissingOrder(_))
        ));
    }

    #[test]
    fn order_coordinates_skip_sentinels() {
        let (_dir, conn) = seeded();
        let orders = load_unresolved_orders(&conn, "Out of Area").unwrap();
        let good = insert_known_location(
            &conn,
            &orders[0],
            LocationFix::Resolved(Coordinates::from_degrees(30.5, -97.7)),
        )
        .unwrap();
        let bad = insert_known_location(&conn, &orders[1], LocationFix::NotFound).unwrap();
        associate_order(&conn, "A1", &good.id).unwrap();
        associate_order(&conn, "A2", &bad.id).unwrap();

        let coords = load_order_coordinates(&conn).unwrap();
        assert_eq!(
            coords,
            vec![Coordinates::from_stored("30.5000000", "-97.7000000")]
        );
    }

    #[test]
    fn rejects_unknown_resolution_rows() {
        let (_dir, conn) = seeded();
        let result = conn.execute(
            "INSERT INTO known_addrs (id, addr, city, zipcode, resolution, created_at, last_modified_at)
            VALUES ('x', 'a', 'b', 1, 'INV', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
