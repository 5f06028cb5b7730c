diesel::table! {
    payments (id) {
        id -> Uuid,
        booking_id -> Uuid,
        user_id -> Uuid,
        amount -> Int8,
        currency -> Varchar,
        method -> Varchar,
        status -> Varchar,
        transaction_id -> Varchar,
        refunded_amount -> Int8,
        paid_at -> Nullable<Timestamptz>,
        refunded_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    refunds (id) {
        id -> Uuid,
        payment_id -> Uuid,
        amount -> Int8,
        reason -> Text,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    dead_letters (id) {
        id -> Uuid,
        topic -> Varchar,
        kafka_partition -> Int4,
        kafka_offset -> Int8,
        message_key -> Nullable<Text>,
        payload -> Bytea,
        error -> Text,
        attempts -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(refunds -> payments (payment_id));

diesel::allow_tables_to_appear_in_same_query!(
    payments,
    refunds,
    dead_letters,
);
