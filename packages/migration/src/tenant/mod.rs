pub mod m20250901_000001_create_clients;
pub mod m20250901_000002_create_stock_items;
pub mod m20250901_000003_create_invoices;
