//! Prompt text for each stage
//!
//! The procurement schema, its field descriptions and the few-shot pipelines
//! are shared between the query writer and the validator so both judge
//! pipelines against the same picture of the collection.

use crate::state_machine::StageId;
use crate::tools::YearBounds;
use chrono::NaiveDate;
use std::fmt::Write;

/// Shape of a document in the orders collection
const ORDER_SCHEMA: &str = r#"{
    "_id": "ObjectId",
    "purchaseOrderNumber": "string",
    "creationDate": "Date",
    "purchaseDate": "Date",
    "fiscalYear": "string",
    "departmentName": "string",
    "supplierName": "string",
    "supplierCode": "string",
    "supplierQualifications": "string",
    "acquisitionType": "string",
    "acquisitionMethod": "string",
    "calCardUsed": "string",
    "totalPrice": "string",
    "lineItems": [
        {
            "itemName": "string",
            "itemDescription": "string",
            "itemDescriptionUUID": "string",
            "quantity": "Double",
            "unitPrice": "Double",
            "totalPrice": "Double",
            "normalizedUNSPSC": "string",
            "commodityTitle": "string",
            "commodityTitleUUID": "string"
        }
    ]
}"#;

const ORDER_SCHEMA_DESCRIPTION: &str = r#"The collection holds purchase orders with their line items nested as an array inside each order document.

Purchase order fields:
- _id: unique identifier of the document.
- creationDate: system-generated date the order was created. This is the primary date reference.
- purchaseDate: user-provided purchase date; it can be earlier than creationDate.
- fiscalYear: fiscal year derived from creationDate (July 1 to June 30).
- purchaseOrderNumber: order identifier, unique within a department but not across departments.
- departmentName: normalized name of the purchasing department.
- supplierName: supplier name as registered during account setup.
- supplierCode: numeric code identifying the supplier.
- supplierQualifications: certifications such as SB (Small Business), DVBE (Disabled Veteran Business Enterprise), SBE (Small Business Enterprise), NP (Non-Profit) or MB (Micro Business).
- acquisitionType: category of the acquisition, e.g. IT Goods, NON-IT Goods, IT Services.
- acquisitionMethod: method or process used to acquire the items.
- calCardUsed: whether a state-issued credit card (CalCard) was used. Values are "Yes" or "No".
- totalPrice: order total as a currency string such as "$1,200.00".

Line item fields (elements of lineItems):
- itemName: name of the purchased item.
- itemDescription: detailed description of the item.
- itemDescriptionUUID: identifier of the normalized item description.
- quantity: number of units purchased.
- unitPrice: cost per unit.
- totalPrice: line total excluding taxes and shipping.
- normalizedUNSPSC: normalized UNSPSC classification code.
- commodityTitle: title associated with the UNSPSC code.
- commodityTitleUUID: identifier of the normalized commodity title."#;

/// (question, pipeline) pairs shown to the query writer
pub const FEW_SHOT_PIPELINES: &[(&str, &str)] = &[
    (
        "what is Total number of orders created during Q1 of 2013",
        r#"[
    {"$match": {"creationDate": {"$gte": datetime.datetime(2013, 1, 1, 0, 0, 0), "$lte": datetime.datetime(2013, 3, 31, 23, 59, 59)}}},
    {"$count": "total_orders"}
]"#,
    ),
    (
        "what is sum of all values in total price field in 2013",
        r#"[
    {"$match": {"creationDate": {"$gte": datetime.datetime(2013, 1, 1, 0, 0, 0), "$lte": datetime.datetime(2013, 12, 31, 23, 59, 59)}}},
    {"$addFields": {"numericTotalPrice": {"$convert": {"input": {"$substr": ["$totalPrice", 1, -1]}, "to": "double", "onError": 0, "onNull": 0}}}},
    {"$group": {"_id": None, "total_price_sum": {"$sum": "$numericTotalPrice"}}},
    {"$project": {"_id": 0, "total_price_sum": 1}}
]"#,
    ),
    (
        "what is Identification of the quarter with the highest spending",
        r#"[
    {"$addFields": {"numericTotalPrice": {"$convert": {"input": {"$substr": ["$totalPrice", 1, -1]}, "to": "double", "onError": 0, "onNull": 0}}}},
    {"$group": {"_id": {"year": {"$year": "$creationDate"}, "quarter": {"$ceil": {"$divide": [{"$month": "$creationDate"}, 3]}}}, "total_spending": {"$sum": "$numericTotalPrice"}}},
    {"$sort": {"total_spending": -1}},
    {"$limit": 1},
    {"$project": {"quarter": "$_id.quarter", "year": "$_id.year", "total_spending": 1, "_id": 0}}
]"#,
    ),
    (
        "Total spending grouped by Acquisition Type in 2013",
        r#"[
    {"$match": {"creationDate": {"$gte": datetime.datetime(2013, 1, 1, 0, 0, 0), "$lte": datetime.datetime(2013, 12, 31, 23, 59, 59)}}},
    {"$addFields": {"numeric_price": {"$convert": {"input": {"$substr": ["$totalPrice", 1, -1]}, "to": "double", "onError": 0, "onNull": 0}}}},
    {"$group": {"_id": "$acquisitionType", "total_spending": {"$sum": "$numeric_price"}}},
    {"$sort": {"total_spending": -1}}
]"#,
    ),
];

/// Stages the greeting stage may hand the conversation to
const GREETING_ROUTES: &[(StageId, &str)] = &[(StageId::Analytics, "Can analyze the data.")];

pub fn greeting() -> String {
    let mut prompt = String::from(
        "You are a Procurement Chatbot Assistant called Penny, here to help users interact with procurement data.
Your role is to greet the user, understand their needs, and guide them to the appropriate specialized assistant if necessary.

Your primary goal is to:
- Welcome the user.
- Identify their needs by asking clarifying questions.
- Redirect them to the appropriate assistant with the redirect tool if their request requires specialized tasks.

Here are the assistants you can redirect to:
",
    );
    for (stage, description) in GREETING_ROUTES {
        let _ = writeln!(prompt, "- {}: {description}", stage.agent_name());
    }
    prompt.push_str(
        "
Example conversation:
user: Hello
assistant: Hello! Welcome to the Procurement Chatbot. How can I assist you today?
user: Can you show me the total number of orders placed last month?
assistant: Sure! Let me connect you to our analytics assistant for that.
tool_call: redirect",
    );
    prompt
}

pub fn analytics(bounds: YearBounds, current_date: NaiveDate) -> String {
    let YearBounds { min, max } = bounds;
    format!(
        "You are an Analytics Agent specialized in procurement data.
Users may ask you to query or analyze procurement data from the database.
You have these tools to help you:
- write_query

Your process:
1. First, validate the user's request. If the request specifies a year outside the range of {min} to {max}, clarify this to the user without proposing a query.
2. Write a query with the write_query tool if one is required.
3. Format results for the user in a readable way.

Important constraints:
- The minimum year for queries is {min}.
- The maximum year for queries is {max}.
- If the user's request includes a year outside this range, clarify the constraint instead of generating or executing a query.
- Don't ask the user to run the generated query. Just generate it.

Examples:
User: Show me total orders for {before}
Assistant: {explanation}

User: Show me total orders for {min_plus}
Assistant: Sure. Let me write a query for that.
tool_call: write_query

Current Date: {current_date}",
        before = min - 2,
        min_plus = min + 1,
        explanation = bounds.explanation(),
        current_date = current_date.format("%Y-%m-%d"),
    )
}

/// Instructions for the structured query-writing call
pub fn query_writer(bounds: YearBounds) -> String {
    let mut prompt = format!(
        "You are an expert in crafting aggregation pipelines over a document database.
Generate an aggregation pipeline that answers the user's question, using the ORDER schema and its description below.
Write dates as `datetime.datetime(2013, 1, 1)`. The data covers {} to {}.
Only read-only stages are allowed: $match, $group, $project, $addFields, $set, $unwind, $sort, $limit, $skip, $count.

ORDER schema:
{ORDER_SCHEMA}

ORDER schema description:
{ORDER_SCHEMA_DESCRIPTION}

Here are some examples:
",
        bounds.min, bounds.max
    );
    for (question, pipeline) in FEW_SHOT_PIPELINES {
        let _ = write!(prompt, "\nInput: {question}\nOutput: {pipeline}\n");
    }
    prompt.push_str(
        "\nReturn only the pipeline in the `pipeline` field, with no additional text.",
    );
    prompt
}

pub fn validation() -> String {
    format!(
        "You are an Expert Validation Agent. Your task is to validate the aggregation pipeline proposed by the Analytics Agent.
Review the following:
1. Ensure the pipeline references only the single existing collection (ORDER).
2. Ensure the pipeline does not contain destructive operations (e.g. insert, update, delete, drop, rename).
3. Ensure the pipeline does not pose security risks or attempt to access system collections.
4. Validate that predicates and stages match the fields described in the schema.
5. Validate that the pipeline follows valid aggregation syntax.

ORDER schema:
{ORDER_SCHEMA}

ORDER schema description:
{ORDER_SCHEMA_DESCRIPTION}

Validation rules:
1. Pipelines must be read-only and use aggregation stages exclusively.
2. The pipeline must not alter the database state or modify data in any form.
3. If the user question cannot be fully answered with an aggregation pipeline, check that the pipeline retrieves the closest relevant data.
4. Dates must be written with `datetime.datetime(...)` where applicable.

If the pipeline is valid, explain why it is valid.
If it is invalid, concisely highlight which parts are incorrect, pose security issues, or deviate from the schema."
    )
}

/// User turn of the validation call
pub fn validation_input(user_query: &str, generated_query: &str) -> String {
    format!(
        "User asked query:\n{user_query}\n\nGenerated pipeline:\n{generated_query}\n\nDetermine whether the generated pipeline is valid."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_pipeline;

    #[test]
    fn test_greeting_lists_routes() {
        let prompt = greeting();
        assert!(prompt.contains("Penny"));
        assert!(prompt.contains("- Analytics_Agent: Can analyze the data."));
        assert!(prompt.contains("tool_call: redirect"));
    }

    #[test]
    fn test_analytics_uses_bounds() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let prompt = analytics(YearBounds::new(2012, 2015), date);
        assert!(prompt.contains("range of 2012 to 2015"));
        assert!(prompt.contains("Show me total orders for 2010"));
        assert!(prompt.contains("Current Date: 2024-06-01"));
    }

    #[test]
    fn test_query_writer_includes_schema_and_examples() {
        let prompt = query_writer(YearBounds::default());
        assert!(prompt.contains("\"lineItems\""));
        assert!(prompt.contains("calCardUsed"));
        assert_eq!(prompt.matches("Input: ").count(), FEW_SHOT_PIPELINES.len());
    }

    #[test]
    fn test_few_shot_pipelines_parse() {
        for (question, pipeline) in FEW_SHOT_PIPELINES {
            assert!(
                parse_pipeline(pipeline).is_ok(),
                "example for {question:?} does not parse"
            );
        }
    }

    #[test]
    fn test_validation_input() {
        let text = validation_input("orders in 2013", "[{\"$count\": \"n\"}]");
        assert!(text.contains("orders in 2013"));
        assert!(text.contains("$count"));
    }
}
