//! Conversation history endpoint.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};

use super::conversation_store::{history_text, short_name};
use super::routes::{internal_error, missing_parameter, ApiError, ApiResult, AppState};
use super::types::{ConvHistoryRequest, ConvHistoryResponse, ErrorBody};

/// `POST /conv-history`, dispatched on `func_name`:
///
/// - `newchat`: create a thread for `user_details.user_mail`
/// - `chatconversation`: prior-turn history text of `thread_id`
/// - `retrieveconversation`: stored messages of `thread_id`
/// - `chathistory`: threads of `user_details.user_mail`
/// - `feedback`: set `feedback` on `message_id`
pub async fn conv_history(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConvHistoryRequest>,
) -> ApiResult<ConvHistoryResponse> {
    let func_name = req
        .func_name
        .as_deref()
        .ok_or_else(|| missing_parameter("func_name"))?;
    let store = &state.conversations;
    let mut response = ConvHistoryResponse::default();

    match func_name {
        "newchat" => {
            let email = user_mail(&req)?;
            let name = short_name(req.user_input.as_deref().unwrap_or_default());
            let thread = store
                .create_thread(&email, &name)
                .await
                .map_err(internal_error)?;
            response.thread_id = Some(thread.thread_id);
            response.short_name = thread.short_name;
            response.conversation_history = Some(String::new());
        }
        "chatconversation" => {
            let thread_id = thread_id(&req)?;
            let messages = store.messages(&thread_id).await.map_err(internal_error)?;
            response.conversation_history = Some(history_text(&messages));
            response.thread_id = Some(thread_id);
        }
        "retrieveconversation" => {
            let thread_id = thread_id(&req)?;
            let messages = store.messages(&thread_id).await.map_err(internal_error)?;
            response.chat_conversation = Some(messages);
            response.thread_id = Some(thread_id);
        }
        "chathistory" => {
            let email = user_mail(&req)?;
            let threads = store.list_threads(&email).await.map_err(internal_error)?;
            response.user_chat_history = Some(threads);
        }
        "feedback" => {
            let message_id = req
                .message_id
                .as_deref()
                .ok_or_else(|| missing_parameter("message_id"))?;
            let feedback = req
                .feedback
                .as_deref()
                .ok_or_else(|| missing_parameter("feedback"))?;
            let updated = store
                .update_feedback(message_id, feedback)
                .await
                .map_err(internal_error)?;
            if !updated {
                tracing::warn!(message_id, "Feedback for unknown message");
            }
            response.feedback = Some(updated);
        }
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: format!("Unknown func_name: {}", other),
                    details: None,
                }),
            ));
        }
    }

    Ok(Json(response))
}

fn user_mail(req: &ConvHistoryRequest) -> Result<String, ApiError> {
    req.user_details
        .as_ref()
        .and_then(|d| d.user_mail.clone())
        .ok_or_else(|| missing_parameter("user_details.user_mail"))
}

fn thread_id(req: &ConvHistoryRequest) -> Result<String, ApiError> {
    req.thread_id
        .clone()
        .ok_or_else(|| missing_parameter("thread_id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::tests::test_state;
    use crate::testing::ScriptedLlm;
    use crate::workflow::UserDetails;

    fn request(func_name: &str) -> ConvHistoryRequest {
        ConvHistoryRequest {
            func_name: Some(func_name.to_string()),
            user_details: Some(UserDetails {
                user_mail: Some("ana@example.com".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_history_functions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Arc::new(ScriptedLlm::new()));

        let mut new_chat = request("newchat");
        new_chat.user_input = Some("Quarterly revenue by region".to_string());
        let Json(created) = conv_history(State(Arc::clone(&state)), Json(new_chat))
            .await
            .expect("newchat");
        assert_eq!(created.short_name, "Quarterly Revenue Region");
        let thread_id = created.thread_id.expect("thread id");

        let stored = state
            .conversations
            .append_exchange(&thread_id, "Revenue?", "Up", 1, 1)
            .await
            .expect("append");

        let mut chat = request("chatconversation");
        chat.thread_id = Some(thread_id.clone());
        let Json(history) = conv_history(State(Arc::clone(&state)), Json(chat))
            .await
            .expect("chatconversation");
        assert_eq!(
            history.conversation_history.as_deref(),
            Some("HumanMessage=Revenue?\nAIMessage=Up")
        );

        let mut feedback = request("feedback");
        feedback.message_id = Some(stored[1].message_id.clone());
        feedback.feedback = Some("thumbs_down".to_string());
        let Json(updated) = conv_history(State(Arc::clone(&state)), Json(feedback))
            .await
            .expect("feedback");
        assert_eq!(updated.feedback, Some(true));

        let mut retrieve = request("retrieveconversation");
        retrieve.thread_id = Some(thread_id.clone());
        let Json(conversation) = conv_history(State(Arc::clone(&state)), Json(retrieve))
            .await
            .expect("retrieve");
        let messages = conversation.chat_conversation.expect("messages");
        assert_eq!(messages[1].feedback, "thumbs_down");

        let Json(listing) = conv_history(State(Arc::clone(&state)), Json(request("chathistory")))
            .await
            .expect("chathistory");
        assert_eq!(listing.user_chat_history.map(|t| t.len()), Some(1));
    }

    #[tokio::test]
    async fn test_missing_parameters_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Arc::new(ScriptedLlm::new()));

        let err = conv_history(State(Arc::clone(&state)), Json(ConvHistoryRequest::default()))
            .await
            .expect_err("no func_name");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = conv_history(State(state), Json(request("chatconversation")))
            .await
            .expect_err("no thread id");
        assert_eq!(err.1.error, "Missing required parameter: thread_id");
    }
}
