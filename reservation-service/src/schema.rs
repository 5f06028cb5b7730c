diesel::table! {
    bookings (id) {
        id -> Uuid,
        venue_id -> Uuid,
        client_id -> Uuid,
        owner_id -> Uuid,
        start_at -> Timestamptz,
        end_at -> Timestamptz,
        price_cents -> Int8,
        status -> Varchar,
        reason_for_cancel -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
