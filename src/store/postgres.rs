use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use uuid::Uuid;

use crate::shared::models::{
    Conversation, ConversationMessage, Customer, CustomerIdentifier, DeadLetterRecord,
    EscalationRecord, ProcessedEvent, Ticket, CONVERSATION_ACTIVE, CONVERSATION_CLOSED,
};
use crate::shared::schema::{
    conversation_messages, conversations, customer_identifiers, customers, dead_letters,
    escalations, processed_events, tickets,
};
use crate::store::{EngineStore, InsertOutcome, StoreError};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_pool(database_url: &str) -> Result<DbPool, StoreError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .build(manager)
        .map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn map_db(e: DieselError) -> StoreError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            StoreError::Conflict(info.message().to_string())
        }
        DieselError::NotFound => StoreError::NotFound("row".to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

/// Production store: diesel over PostgreSQL with an r2d2 pool. Uniqueness
/// constraints ((kind, value) on identifiers, the processed-events primary
/// key) are enforced by the database.
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        self.pool
            .get()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl EngineStore for PgStore {
    async fn has_processed(&self, event_key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let found: Option<ProcessedEvent> = processed_events::table
            .find(event_key)
            .first(&mut conn)
            .optional()
            .map_err(map_db)?;
        Ok(found.is_some())
    }

    async fn mark_processed(&self, event_key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let record = ProcessedEvent {
            event_key: event_key.to_string(),
            processed_at: Utc::now(),
        };
        // A duplicate mark is fine; the record's existence is the signal.
        diesel::insert_into(processed_events::table)
            .values(&record)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn find_identifier(
        &self,
        kind: &str,
        value: &str,
    ) -> Result<Option<CustomerIdentifier>, StoreError> {
        let mut conn = self.conn()?;
        customer_identifiers::table
            .filter(customer_identifiers::kind.eq(kind))
            .filter(customer_identifiers::value.eq(value))
            .first(&mut conn)
            .optional()
            .map_err(map_db)
    }

    async fn insert_identifier(
        &self,
        customer_id: Uuid,
        kind: &str,
        value: &str,
    ) -> Result<InsertOutcome, StoreError> {
        let mut conn = self.conn()?;
        let row = CustomerIdentifier {
            id: Uuid::new_v4(),
            customer_id,
            kind: kind.to_string(),
            value: value.to_string(),
            created_at: Utc::now(),
        };
        let inserted = diesel::insert_into(customer_identifiers::table)
            .values(&row)
            .on_conflict((customer_identifiers::kind, customer_identifiers::value))
            .do_nothing()
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(if inserted == 0 {
            InsertOutcome::Conflict
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn create_customer(&self, customer: Customer) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(customers::table)
            .values(&customer)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn get_customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError> {
        let mut conn = self.conn()?;
        customers::table
            .find(id)
            .first(&mut conn)
            .optional()
            .map_err(map_db)
    }

    async fn update_customer(&self, customer: &Customer) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::update(customers::table.find(customer.id))
            .set(customer)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>, StoreError> {
        let mut conn = self.conn()?;
        customers::table
            .filter(customers::primary_email.eq(email))
            .filter(customers::merged_into.is_null())
            .first(&mut conn)
            .optional()
            .map_err(map_db)
    }

    async fn merge_customers(&self, canonical: Uuid, absorbed: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.transaction::<_, DieselError, _>(|conn| {
            diesel::update(
                customer_identifiers::table
                    .filter(customer_identifiers::customer_id.eq(absorbed)),
            )
            .set(customer_identifiers::customer_id.eq(canonical))
            .execute(conn)?;

            diesel::update(conversations::table.filter(conversations::customer_id.eq(absorbed)))
                .set(conversations::customer_id.eq(canonical))
                .execute(conn)?;

            diesel::update(tickets::table.filter(tickets::customer_id.eq(absorbed)))
                .set(tickets::customer_id.eq(canonical))
                .execute(conn)?;

            // At most one active conversation per customer: keep the most
            // recently active one and close the rest.
            let surviving: Vec<Conversation> = conversations::table
                .filter(conversations::customer_id.eq(canonical))
                .filter(conversations::status.eq(CONVERSATION_ACTIVE))
                .order(conversations::last_activity_at.desc())
                .load(conn)?;
            for stale in surviving.iter().skip(1) {
                diesel::update(conversations::table.find(stale.id))
                    .set((
                        conversations::status.eq(CONVERSATION_CLOSED),
                        conversations::ended_at.eq(Some(Utc::now())),
                    ))
                    .execute(conn)?;
            }

            let absorbed_row: Customer = customers::table.find(absorbed).first(conn)?;
            diesel::update(customers::table.find(absorbed))
                .set((
                    customers::merged_into.eq(Some(canonical)),
                    customers::primary_email.eq(None::<String>),
                    customers::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;

            let canonical_row: Customer = customers::table.find(canonical).first(conn)?;
            diesel::update(customers::table.find(canonical))
                .set((
                    customers::interaction_count
                        .eq(canonical_row.interaction_count + absorbed_row.interaction_count),
                    customers::primary_email.eq(canonical_row
                        .primary_email
                        .or(absorbed_row.primary_email)),
                    customers::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .map_err(map_db)
    }

    async fn active_conversation(
        &self,
        customer_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut conn = self.conn()?;
        conversations::table
            .filter(conversations::customer_id.eq(customer_id))
            .filter(conversations::status.eq(CONVERSATION_ACTIVE))
            .order(conversations::started_at.desc())
            .first(&mut conn)
            .optional()
            .map_err(map_db)
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(conversations::table)
            .values(&conversation)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::update(conversations::table.find(conversation.id))
            .set(conversation)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn append_message(&self, message: ConversationMessage) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(conversation_messages::table)
            .values(&message)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let mut conn = self.conn()?;
        conversation_messages::table
            .filter(conversation_messages::conversation_id.eq(conversation_id))
            .order(conversation_messages::created_at.asc())
            .load(&mut conn)
            .map_err(map_db)
    }

    async fn ticket_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn()?;
        tickets::table
            .filter(tickets::conversation_id.eq(conversation_id))
            .first(&mut conn)
            .optional()
            .map_err(map_db)
    }

    async fn create_ticket(&self, ticket: Ticket) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(tickets::table)
            .values(&ticket)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::update(tickets::table.find(ticket.id))
            .set(ticket)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn()?;
        tickets::table
            .find(id)
            .first(&mut conn)
            .optional()
            .map_err(map_db)
    }

    async fn list_tickets(&self, status: Option<&str>) -> Result<Vec<Ticket>, StoreError> {
        let mut conn = self.conn()?;
        let mut query = tickets::table.into_boxed();
        if let Some(status) = status {
            query = query.filter(tickets::status.eq(status.to_string()));
        }
        query
            .order(tickets::created_at.asc())
            .load(&mut conn)
            .map_err(map_db)
    }

    async fn record_escalation(&self, record: EscalationRecord) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(escalations::table)
            .values(&record)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }

    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(dead_letters::table)
            .values(&record)
            .execute(&mut conn)
            .map_err(map_db)?;
        Ok(())
    }
}
