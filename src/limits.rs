/// Max users registered per site.
pub const MAX_USERS_PER_SITE: usize = 100_000;

/// Max machines per site.
pub const MAX_MACHINES_PER_SITE: usize = 10_000;

/// Max bookings (all statuses) per site.
pub const MAX_BOOKINGS_PER_SITE: usize = 1_000_000;

/// Max certifications held by one user.
pub const MAX_CERTIFICATIONS_PER_USER: usize = 1_024;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TYPE_LEN: usize = 64;
pub const MAX_NOTE_LEN: usize = 2_048;

/// Time labels are opaque (`"09:00-10:00"`), but bounded.
pub const MAX_TIME_LABEL_LEN: usize = 64;

pub const MAX_SITES: usize = 1_024;
pub const MAX_SITE_NAME_LEN: usize = 128;

/// Largest WAL frame payload. A longer length prefix is read as a torn tail.
pub const MAX_WAL_FRAME_LEN: usize = 16 * 1024 * 1024;
